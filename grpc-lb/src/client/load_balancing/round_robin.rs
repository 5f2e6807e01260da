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

//! The round_robin policy: connects to every address and spreads calls
//! across all READY subchannels in turn.

use std::collections::HashSet;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, Pick, PickArgs, PickResult, Picker, QueuingPicker, SubchannelState,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::subchannel::{SubchannelId, SubchannelRef};

pub static POLICY_NAME: &str = "round_robin";
static START: Once = Once::new();

struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            subchannels: Vec::new(),
            last_connection_error: None,
            resolution_note: None,
            published: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

/// Register round robin as a LbPolicy.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RoundRobinBuilder {});
    });
}

struct TrackedSubchannel {
    subchannel: SubchannelRef,
    state: ConnectivityState,
}

struct RoundRobinPolicy {
    subchannels: Vec<TrackedSubchannel>,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    resolution_note: Option<String>,
    // The aggregate state and READY set of the last published picker.
    published: Option<(ConnectivityState, Vec<SubchannelId>)>,
}

impl RoundRobinPolicy {
    // Sends a picker for the aggregate state of the subchannels.
    //
    // If any subchannel is READY, round robin across all READY subchannels.
    // Otherwise, if any subchannel is IDLE or CONNECTING, queue picks.
    // Otherwise, every subchannel is failing: send a Transient Failure picker
    // and ask for new addresses.
    fn send_aggregate_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let ready: Vec<SubchannelRef> = self
            .subchannels
            .iter()
            .filter(|tracked| tracked.state == ConnectivityState::Ready)
            .map(|tracked| tracked.subchannel.clone())
            .collect();
        let aggregate = if !ready.is_empty() {
            ConnectivityState::Ready
        } else if self.subchannels.iter().any(|tracked| {
            matches!(
                tracked.state,
                ConnectivityState::Idle | ConnectivityState::Connecting
            )
        }) {
            ConnectivityState::Connecting
        } else {
            ConnectivityState::TransientFailure
        };

        let ids: Vec<SubchannelId> = ready.iter().map(SubchannelRef::id).collect();
        let unchanged = self
            .published
            .as_ref()
            .is_some_and(|(state, published)| *state == aggregate && *published == ids);
        if unchanged && aggregate != ConnectivityState::TransientFailure {
            return;
        }
        tracing::debug!(state = %aggregate, ready = ready.len(), "round_robin publishing picker");
        self.published = Some((aggregate, ids));

        match aggregate {
            ConnectivityState::Ready => channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RoundRobinPicker::new(ready)),
            }),
            ConnectivityState::TransientFailure => {
                let error = match &self.last_connection_error {
                    Some(err) => format!("all subchannels failed; last connection error: {err}"),
                    None => "all subchannels failed".to_string(),
                };
                self.move_to_transient_failure(channel_controller, error);
            }
            _ => channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(QueuingPicker {}),
            }),
        }
    }

    fn move_to_transient_failure(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        mut error: String,
    ) {
        if let Some(note) = &self.resolution_note {
            error = format!("{error} ({note})");
        }
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
    }

    fn connect_idle_subchannels(&self) {
        for tracked in &self.subchannels {
            if tracked.state == ConnectivityState::Idle {
                tracked.subchannel.connect();
            }
        }
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut uniques = HashSet::new();
        let addresses: Vec<Address> = update
            .addresses
            .into_iter()
            .filter(|address| uniques.insert(address.clone()))
            .collect();
        tracing::debug!(addresses = addresses.len(), "round_robin received resolver update");
        self.resolution_note = update.resolution_note;

        if addresses.is_empty() {
            self.subchannels.clear();
            self.published = Some((ConnectivityState::TransientFailure, Vec::new()));
            self.move_to_transient_failure(
                channel_controller,
                "received empty address list from the name resolver".to_string(),
            );
            return Ok(());
        }

        // Subchannels for addresses that remain are kept along with their
        // state; the rest are released when the old list is dropped.
        let mut old = std::mem::take(&mut self.subchannels);
        for address in &addresses {
            let tracked = match old
                .iter()
                .position(|tracked| tracked.subchannel.address() == address)
            {
                Some(idx) => old.swap_remove(idx),
                None => {
                    let subchannel = channel_controller.new_subchannel(address);
                    let state = subchannel.state().connectivity_state;
                    TrackedSubchannel { subchannel, state }
                }
            };
            self.subchannels.push(tracked);
        }
        drop(old);

        self.connect_idle_subchannels();
        self.send_aggregate_picker(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: &SubchannelRef,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(tracked) = self
            .subchannels
            .iter_mut()
            .find(|tracked| tracked.subchannel == *subchannel)
        else {
            tracing::trace!(%subchannel, "round_robin ignoring update for removed subchannel");
            return;
        };
        tracked.state = state.connectivity_state;
        match state.connectivity_state {
            ConnectivityState::Idle => subchannel.connect(),
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
            }
            _ => {}
        }
        self.send_aggregate_picker(channel_controller);
    }

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        self.connect_idle_subchannels();
    }
}

struct RoundRobinPicker {
    subchannels: Vec<SubchannelRef>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<SubchannelRef>) -> Self {
        let random_index: usize = rand::random_range(..subchannels.len());
        Self {
            subchannels,
            next: AtomicUsize::new(random_index),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &PickArgs<'_>) -> PickResult {
        let len = self.subchannels.len();
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
        PickResult::Pick(Pick::new(self.subchannels[idx].clone()))
    }
}
