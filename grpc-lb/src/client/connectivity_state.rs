/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Connectivity state tracking with single-shot watchers.
//!
//! A [`ConnectivityStateTracker`] holds one [`ConnectivityState`] value and the
//! list of watchers waiting for it to change.  Every watcher is consumed when
//! it fires, so each registration observes exactly one transition.
//!
//! The tracker performs no synchronization of its own.  Its owner decides the
//! execution context: a load balancing policy only touches its tracker while
//! confined to its work serializer.

use tonic::Status;

use super::ConnectivityState;

/// A single-shot callback invoked with the new state once a watched state
/// changes.
pub type StateWatcher = Box<dyn FnOnce(ConnectivityState) + Send>;

pub struct ConnectivityStateTracker {
    name: &'static str,
    state: ConnectivityState,
    status: Option<Status>,
    watchers: Vec<StateWatcher>,
}

impl ConnectivityStateTracker {
    /// Creates a tracker in the given initial state.  `name` is only used for
    /// logging.
    pub fn new(name: &'static str, initial: ConnectivityState) -> Self {
        Self {
            name,
            state: initial,
            status: None,
            watchers: Vec::new(),
        }
    }

    /// Returns the current state.  Never blocks.
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Returns the status that accompanied the most recent state update, if
    /// any.  Typically set for TransientFailure and Shutdown.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Registers interest in the next change away from `expected`.
    ///
    /// If the current state already differs from `expected`, the watcher is
    /// handed back to the caller, which must invoke it with [`Self::state`]
    /// outside of its current frame.  Otherwise it is queued and fires on the
    /// next transition.
    #[must_use = "a stale watcher is returned and must be fired by the caller"]
    pub fn watch(
        &mut self,
        expected: ConnectivityState,
        watcher: StateWatcher,
    ) -> Option<StateWatcher> {
        if self.state != expected {
            return Some(watcher);
        }
        if self.state.is_terminal() {
            // Nothing ever follows Shutdown.
            tracing::debug!(tracker = self.name, "dropping watcher registered on a terminal state");
            return None;
        }
        self.watchers.push(watcher);
        None
    }

    /// Updates the state, firing every queued watcher if it changed.
    ///
    /// Returns whether a transition happened.  Updates after Shutdown are
    /// ignored.
    pub fn set_state(&mut self, state: ConnectivityState, status: Option<Status>) -> bool {
        if self.state.is_terminal() {
            tracing::warn!(
                tracker = self.name,
                requested = %state,
                "ignoring connectivity state update after shutdown"
            );
            return false;
        }
        self.status = status;
        if self.state == state {
            return false;
        }
        tracing::debug!(tracker = self.name, from = %self.state, to = %state, "connectivity state change");
        self.state = state;
        for watcher in std::mem::take(&mut self.watchers) {
            watcher(state);
        }
        true
    }

    /// The number of watchers waiting for the next transition.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}
