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

//! A single-writer serializing executor.
//!
//! A [`WorkSerializer`] owns a piece of state and a queue of closures that
//! operate on it.  One background task drains the queue, so closures run one
//! at a time, in the order they were scheduled, each with exclusive access to
//! the state.  Confinement is structural: the state is only reachable through
//! the `&mut T` handed to a scheduled closure.

use tokio::sync::mpsc;

use crate::rt::Runtime;

type Work<T> = Box<dyn FnOnce(&mut T) + Send>;

pub(crate) struct WorkSerializer<T> {
    tx: mpsc::UnboundedSender<Work<T>>,
}

impl<T> Clone for WorkSerializer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> WorkSerializer<T> {
    /// Moves `state` into a new drain task spawned on `runtime`.
    ///
    /// The task exits, dropping the state, once every strong handle has been
    /// dropped and the queue is empty.
    pub(crate) fn new(state: T, runtime: &dyn Runtime) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Work<T>>();
        let mut state = state;
        // The task is stopped by closing the queue, never by aborting it.
        runtime.spawn(Box::pin(async move {
            while let Some(work) = rx.recv().await {
                work(&mut state);
            }
        }));
        Self { tx }
    }

    /// Queues `work` to run after everything scheduled before it.  Never
    /// blocks and never runs `work` in the caller's frame.
    ///
    /// Returns false if the serializer has stopped, in which case `work` is
    /// dropped without running.
    pub(crate) fn schedule(&self, work: impl FnOnce(&mut T) + Send + 'static) -> bool {
        self.tx.send(Box::new(work)).is_ok()
    }

    /// Returns a handle that can schedule work without keeping the drain task
    /// alive.
    pub(crate) fn downgrade(&self) -> WeakWorkSerializer<T> {
        WeakWorkSerializer {
            tx: self.tx.downgrade(),
        }
    }
}

pub(crate) struct WeakWorkSerializer<T> {
    tx: mpsc::WeakUnboundedSender<Work<T>>,
}

impl<T> Clone for WeakWorkSerializer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> WeakWorkSerializer<T> {
    /// Like [`WorkSerializer::schedule`]; returns false once the serializer has
    /// stopped.
    pub(crate) fn schedule(&self, work: impl FnOnce(&mut T) + Send + 'static) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(Box::new(work)).is_ok(),
            None => false,
        }
    }
}
