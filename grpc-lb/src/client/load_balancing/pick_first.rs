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

//! The pick_first policy: connects to one address at a time, in order, and
//! sends every call to the first address that becomes READY.

use std::collections::HashSet;
use std::error::Error;
use std::sync::{Arc, Once};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, Pick, PickArgs, PickResult, Picker, QueuingPicker, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::client::subchannel::SubchannelRef;

pub static POLICY_NAME: &str = "pick_first";

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            subchannel_list: None,
            selected_subchannel: None,
            addresses: vec![],
            resolution_note: None,
            last_connection_error: None,
            connectivity_state: ConnectivityState::Connecting,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = match config.convert_to() {
            Ok(c) => c,
            Err(e) => {
                return Err(format!("failed to parse JSON config: {e}").into());
            }
        };
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(super) struct PickFirstConfig {
    shuffle_address_list: Option<bool>,
}

/// Registers pick_first in the global registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>, // Helps to schedule work.
    subchannel_list: Option<SubchannelList>, // List of subchannels, that we are currently connecting to.
    selected_subchannel: Option<SubchannelRef>, // The currently connected subchannel.
    addresses: Vec<Address>,                 // Most recent addresses from the name resolver.
    resolution_note: Option<String>,         // Note attached to the most recent update.
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>, // Most recent error from any subchannel.
    connectivity_state: ConnectivityState, // Overall connectivity state of the policy.
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let shuffle = match config {
            Some(config) => config
                .convert_to::<PickFirstConfig>()
                .ok_or("pick_first received a configuration of another policy")?
                .shuffle_address_list
                .unwrap_or(false),
            None => false,
        };
        let mut addresses = dedup_addresses(update.addresses);
        if shuffle {
            addresses.shuffle(&mut rand::rng());
        }
        tracing::debug!(addresses = ?addresses, "pick_first received resolver update");
        self.resolution_note = update.resolution_note;

        if addresses.is_empty() {
            self.subchannel_list = None;
            self.selected_subchannel = None;
            self.last_connection_error = None;
            self.addresses = vec![];
            self.move_to_transient_failure(channel_controller);
            return Ok(());
        }
        self.addresses = addresses;

        // Keep the connected subchannel if it is still part of the update.
        if let Some(selected) = &self.selected_subchannel {
            if self.addresses.contains(selected.address()) {
                self.subchannel_list = None;
                return Ok(());
            }
        }
        // In IDLE, connecting is left to exit_idle().
        if self.connectivity_state != ConnectivityState::Idle {
            self.start_connecting(channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: &SubchannelRef,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        tracing::trace!(%subchannel, %state, "pick_first subchannel update");

        if self
            .subchannel_list
            .as_ref()
            .is_some_and(|list| list.contains(subchannel))
        {
            if state.connectivity_state == ConnectivityState::Ready {
                self.move_to_ready(subchannel.clone(), channel_controller);
            } else {
                self.update_tracked_subchannel(subchannel, state, channel_controller);
            }
            return;
        }

        // Any state change of the connected subchannel means that we are no
        // longer connected.
        if self.selected_subchannel.as_ref() == Some(subchannel)
            && state.connectivity_state != ConnectivityState::Ready
        {
            self.move_to_idle(channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Scheduled by the idle picker.
        if self.connectivity_state == ConnectivityState::Idle {
            self.start_connecting(channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state == ConnectivityState::Idle {
            self.start_connecting(channel_controller);
        }
    }
}

impl PickFirstPolicy {
    // Builds a new subchannel list from the most recent addresses and starts
    // connecting from the first address in the list.
    fn start_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.addresses.is_empty() {
            self.move_to_transient_failure(channel_controller);
            return;
        }
        let mut list = SubchannelList::new(&self.addresses, channel_controller);

        // Subchannels are shared with other policies, so one may already be
        // connected.
        if let Some(ready) = list.first_in_state(ConnectivityState::Ready) {
            self.move_to_ready(ready, channel_controller);
            return;
        }
        self.selected_subchannel = None;
        // TRANSIENT_FAILURE is sticky until a subchannel becomes READY.
        if self.connectivity_state != ConnectivityState::TransientFailure {
            self.move_to_connecting(channel_controller);
        }
        if !list.connect_to_next_subchannel() {
            self.subchannel_list = Some(list);
            self.finish_first_pass(channel_controller);
            return;
        }
        self.subchannel_list = Some(list);
    }

    // Handles updates for subchannels currently in the subchannel list.
    fn update_tracked_subchannel(
        &mut self,
        subchannel: &SubchannelRef,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(list) = self.subchannel_list.as_mut() else {
            return;
        };
        list.set_state(subchannel, state.connectivity_state);

        match state.connectivity_state {
            ConnectivityState::Idle => {
                // Immediately reconnect to subchannels going IDLE once the
                // first pass is complete.
                if list.first_pass_complete {
                    subchannel.connect();
                }
            }
            ConnectivityState::Connecting => {
                if self.connectivity_state == ConnectivityState::Idle {
                    self.move_to_connecting(channel_controller);
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
                if !list.first_pass_complete {
                    if list.is_current(subchannel) && !list.connect_to_next_subchannel() {
                        self.finish_first_pass(channel_controller);
                    }
                } else {
                    list.num_transient_failures += 1;
                    if list.num_transient_failures >= list.len() {
                        // Refresh the error picker and ask for new addresses.
                        list.num_transient_failures = 0;
                        self.move_to_transient_failure(channel_controller);
                    }
                }
            }
            ConnectivityState::Ready | ConnectivityState::Shutdown => {}
        }
    }

    // Every address failed once.  Report TRANSIENT_FAILURE and keep trying all
    // of them in parallel.
    fn finish_first_pass(&mut self, channel_controller: &mut dyn ChannelController) {
        self.move_to_transient_failure(channel_controller);
        if let Some(list) = self.subchannel_list.as_mut() {
            tracing::debug!("pick_first first pass complete, connecting to all subchannels");
            list.first_pass_complete = true;
            list.connect_to_all_subchannels();
        }
    }

    fn move_to_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Idle;
        self.subchannel_list = None;
        self.selected_subchannel = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            }),
        });
        channel_controller.request_resolution();
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state == ConnectivityState::Connecting {
            return;
        }
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
    }

    fn move_to_ready(
        &mut self,
        subchannel: SubchannelRef,
        channel_controller: &mut dyn ChannelController,
    ) {
        tracing::debug!(%subchannel, "pick_first selected subchannel");
        self.connectivity_state = ConnectivityState::Ready;
        self.selected_subchannel = Some(subchannel.clone());
        self.subchannel_list = None;
        self.last_connection_error = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { subchannel }),
        });
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let mut error = match &self.last_connection_error {
            Some(err) => format!("no address is reachable; last connection error: {err}"),
            None if self.addresses.is_empty() => {
                "received empty address list from the name resolver".to_string()
            }
            None => "no address is reachable".to_string(),
        };
        if let Some(note) = &self.resolution_note {
            error = format!("{error} ({note})");
        }
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
    }
}

fn dedup_addresses(mut addresses: Vec<Address>) -> Vec<Address> {
    let mut uniques = HashSet::new();
    addresses.retain(|address| uniques.insert(address.clone()));
    addresses
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    subchannel: SubchannelRef,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &PickArgs<'_>) -> PickResult {
        PickResult::Pick(Pick::new(self.subchannel.clone()))
    }
}

// A picker that always queues picks and schedules work. This triggers the LB
// policy to start connecting from the first address.
struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _request: &PickArgs<'_>) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}

// A list of subchannels created from the most recent address list from the
// resolver, with the last state seen for each of them.
struct SubchannelList {
    subchannels: Vec<(SubchannelRef, ConnectivityState)>,
    current_idx: Option<usize>,
    first_pass_complete: bool,
    num_transient_failures: usize,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let subchannels: Vec<_> = addresses
            .iter()
            .map(|address| {
                let subchannel = channel_controller.new_subchannel(address);
                let state = subchannel.state().connectivity_state;
                (subchannel, state)
            })
            .collect();
        tracing::trace!(count = subchannels.len(), "created new subchannel list");
        SubchannelList {
            subchannels,
            current_idx: None,
            first_pass_complete: false,
            num_transient_failures: 0,
        }
    }

    fn len(&self) -> usize {
        self.subchannels.len()
    }

    fn contains(&self, subchannel: &SubchannelRef) -> bool {
        self.subchannels.iter().any(|(sc, _)| sc == subchannel)
    }

    fn is_current(&self, subchannel: &SubchannelRef) -> bool {
        self.current_idx
            .and_then(|idx| self.subchannels.get(idx))
            .is_some_and(|(sc, _)| sc == subchannel)
    }

    fn set_state(&mut self, subchannel: &SubchannelRef, state: ConnectivityState) {
        if let Some(entry) = self.subchannels.iter_mut().find(|(sc, _)| sc == subchannel) {
            entry.1 = state;
        }
    }

    fn first_in_state(&self, state: ConnectivityState) -> Option<SubchannelRef> {
        self.subchannels
            .iter()
            .find(|(_, s)| *s == state)
            .map(|(sc, _)| sc.clone())
    }

    // Initiates a connection attempt to the next subchannel in the list that
    // has not failed yet.  Returns false if there are no more subchannels in
    // the list.
    fn connect_to_next_subchannel(&mut self) -> bool {
        let start = self.current_idx.map_or(0, |idx| idx + 1);
        for idx in start..self.subchannels.len() {
            let (subchannel, state) = &self.subchannels[idx];
            match state {
                ConnectivityState::Idle => {
                    self.current_idx = Some(idx);
                    subchannel.connect();
                    return true;
                }
                // Already attempting; wait for the outcome.
                ConnectivityState::Connecting => {
                    self.current_idx = Some(idx);
                    return true;
                }
                _ => continue,
            }
        }
        self.current_idx = Some(self.subchannels.len());
        false
    }

    fn connect_to_all_subchannels(&self) {
        for (subchannel, state) in &self.subchannels {
            if *state == ConnectivityState::Idle {
                subchannel.connect();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{Builder, POLICY_NAME, PickFirstConfig};
    use crate::client::ConnectivityState;
    use crate::client::load_balancing::test_utils::{
        FakeSubchannelFactory, TestChannelController, TestEvent, TestWorkScheduler, drain_events,
    };
    use crate::client::load_balancing::{
        GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions, PickResult,
        SubchannelState,
    };
    use crate::client::name_resolution::{Address, ResolverUpdate};
    use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};

    struct Setup {
        policy: Box<dyn LbPolicy>,
        controller: TestChannelController,
        rx_events: mpsc::UnboundedReceiver<TestEvent>,
    }

    impl Setup {
        fn new() -> Self {
            let (tx_events, rx_events) = mpsc::unbounded_channel();
            let factory = Arc::new(FakeSubchannelFactory::new(tx_events.clone()));
            let policy = Builder {}.build(LbPolicyOptions {
                work_scheduler: Arc::new(TestWorkScheduler { tx_events }),
            });
            Setup {
                policy,
                controller: TestChannelController::new(factory),
                rx_events,
            }
        }

        fn send_update(&mut self, update: ResolverUpdate, config: Option<&LbConfig>) {
            self.policy
                .resolver_update(update, config, &mut self.controller)
                .expect("resolver update rejected");
        }

        fn move_subchannel_to_state(&mut self, address: &str, state: ConnectivityState) {
            let subchannel = self.controller.subchannel(address);
            self.policy.subchannel_update(
                &subchannel,
                &SubchannelState::new(state),
                &mut self.controller,
            );
        }

        // Returns the addresses asked to connect since the last call.
        fn connects(&mut self) -> Vec<String> {
            drain_events(&mut self.rx_events)
                .into_iter()
                .filter_map(|event| match event {
                    TestEvent::Connect(address) => Some(address.address),
                    _ => None,
                })
                .collect()
        }

        fn fail_message(&self) -> String {
            match self.controller.pick() {
                PickResult::Fail(status) => status.message().to_string(),
                other => panic!("expected a failing picker, got {other}"),
            }
        }
    }

    fn update(addresses: &[&str]) -> ResolverUpdate {
        ResolverUpdate::new(addresses.iter().map(|a| Address::tcp(*a)).collect())
    }

    #[test]
    fn pickfirst_builder_name() {
        super::reg();
        let builder = GLOBAL_LB_REGISTRY
            .get_policy(POLICY_NAME)
            .expect("pick_first LB policy not registered");
        assert_eq!(builder.name(), "pick_first");
    }

    #[test]
    fn pickfirst_builder_parse_config() {
        let builder = Builder {};
        let cases = [
            (json!({}), None),
            (json!({"shuffleAddressList": false}), Some(false)),
            (json!({"shuffleAddressList": true}), Some(true)),
            (json!({"shuffleAddressList": true, "unknownField": "foo"}), Some(true)),
        ];
        for (json, want) in cases {
            let config = builder
                .parse_config(&ParsedJsonLbConfig::from_value(json.clone()))
                .unwrap_or_else(|e| panic!("parse_config({json}) failed: {e}"))
                .expect("pick_first always produces a config");
            let config = config
                .convert_to::<PickFirstConfig>()
                .expect("config has the pick_first type");
            assert_eq!(config.shuffle_address_list, want, "config {json}");
        }

        let bad = ParsedJsonLbConfig::from_value(json!({"shuffleAddressList": "yes"}));
        assert!(builder.parse_config(&bad).is_err());
    }

    #[test]
    fn pickfirst_connects_in_order_and_picks_first_ready() {
        let mut setup = Setup::new();
        setup.send_update(update(&["a:1", "b:1", "c:1"]), None);
        assert_eq!(setup.connects(), vec!["a:1"]);
        assert_eq!(setup.controller.subchannels.len(), 3);

        setup.move_subchannel_to_state("a:1", ConnectivityState::Connecting);
        setup.move_subchannel_to_state("a:1", ConnectivityState::TransientFailure);
        assert_eq!(setup.connects(), vec!["b:1"]);
        assert_ne!(
            setup.controller.last_state(),
            Some(ConnectivityState::TransientFailure),
            "a single failure is not reported"
        );

        setup.move_subchannel_to_state("b:1", ConnectivityState::Connecting);
        setup.move_subchannel_to_state("b:1", ConnectivityState::Ready);
        assert_eq!(setup.controller.last_state(), Some(ConnectivityState::Ready));
        assert_eq!(setup.controller.pick_address(), "b:1");
        assert_eq!(setup.controller.pick_address(), "b:1");
        assert!(setup.connects().is_empty());
    }

    #[test]
    fn pickfirst_all_addresses_failing_moves_to_transient_failure() {
        let mut setup = Setup::new();
        setup.send_update(update(&["a:1", "b:1"]), None);
        setup.move_subchannel_to_state("a:1", ConnectivityState::TransientFailure);
        setup.move_subchannel_to_state("b:1", ConnectivityState::TransientFailure);
        assert_eq!(
            setup.controller.last_state(),
            Some(ConnectivityState::TransientFailure)
        );
        assert_eq!(setup.controller.resolution_requests, 1);
        assert!(setup.fail_message().contains("no address is reachable"));
        setup.connects();

        // After the first pass, subchannels leaving backoff are reconnected.
        setup.move_subchannel_to_state("a:1", ConnectivityState::Idle);
        assert_eq!(setup.connects(), vec!["a:1"]);

        // Another failure of every address refreshes the error and asks for
        // new addresses again.
        setup.move_subchannel_to_state("a:1", ConnectivityState::TransientFailure);
        assert_eq!(setup.controller.resolution_requests, 1);
        setup.move_subchannel_to_state("b:1", ConnectivityState::TransientFailure);
        assert_eq!(setup.controller.resolution_requests, 2);

        setup.move_subchannel_to_state("a:1", ConnectivityState::Ready);
        assert_eq!(setup.controller.last_state(), Some(ConnectivityState::Ready));
        assert_eq!(setup.controller.pick_address(), "a:1");
    }

    #[test]
    fn pickfirst_selected_subchannel_going_idle_moves_to_idle() {
        let mut setup = Setup::new();
        setup.send_update(update(&["a:1"]), None);
        setup.move_subchannel_to_state("a:1", ConnectivityState::Ready);
        setup.connects();

        setup.move_subchannel_to_state("a:1", ConnectivityState::Idle);
        assert_eq!(setup.controller.last_state(), Some(ConnectivityState::Idle));
        assert_eq!(setup.controller.resolution_requests, 1);

        // A pick on the idle picker queues and triggers a call into work().
        assert!(setup.controller.pick() == PickResult::Queue);
        assert!(drain_events(&mut setup.rx_events).contains(&TestEvent::ScheduleWork));
        setup.policy.work(&mut setup.controller);
        assert_eq!(setup.connects(), vec!["a:1"]);
        assert_eq!(
            setup.controller.last_state(),
            Some(ConnectivityState::Connecting)
        );
    }

    #[test]
    fn pickfirst_exit_idle_reconnects() {
        let mut setup = Setup::new();
        setup.send_update(update(&["a:1"]), None);
        setup.move_subchannel_to_state("a:1", ConnectivityState::Ready);
        setup.move_subchannel_to_state("a:1", ConnectivityState::Idle);
        setup.connects();

        // Updates received while idle do not connect.
        setup.send_update(update(&["b:1"]), None);
        assert!(setup.connects().is_empty());

        setup.policy.exit_idle(&mut setup.controller);
        assert_eq!(setup.connects(), vec!["b:1"]);
    }

    #[test]
    fn pickfirst_empty_update_reports_transient_failure() {
        let mut setup = Setup::new();
        setup.send_update(update(&[]), None);
        assert_eq!(
            setup.controller.last_state(),
            Some(ConnectivityState::TransientFailure)
        );
        assert_eq!(setup.controller.resolution_requests, 1);
        assert!(setup.fail_message().contains("empty address list"));
    }

    #[test]
    fn pickfirst_removes_duplicate_addresses() {
        let mut setup = Setup::new();
        setup.send_update(update(&["a:1", "b:1", "a:1"]), None);
        let created: Vec<_> = setup
            .controller
            .subchannels
            .iter()
            .map(|sc| sc.address().address.clone())
            .collect();
        assert_eq!(created, vec!["a:1", "b:1"]);
    }

    #[test]
    fn pickfirst_update_containing_selected_address_keeps_it() {
        let mut setup = Setup::new();
        setup.send_update(update(&["a:1"]), None);
        setup.move_subchannel_to_state("a:1", ConnectivityState::Ready);
        let pickers = setup.controller.pickers.len();

        setup.send_update(update(&["b:1", "a:1"]), None);
        assert_eq!(setup.controller.subchannels.len(), 1);
        assert_eq!(setup.controller.pickers.len(), pickers);
        assert_eq!(setup.controller.pick_address(), "a:1");
    }

    #[test]
    fn pickfirst_shuffle_keeps_every_address() {
        let mut setup = Setup::new();
        let config = Builder {}
            .parse_config(&ParsedJsonLbConfig::from_value(
                json!({"shuffleAddressList": true}),
            ))
            .unwrap();
        let addresses: Vec<String> = (0..20).map(|i| format!("10.0.0.{i}:443")).collect();
        let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
        setup.send_update(update(&refs), config.as_ref());

        let created: HashSet<String> = setup
            .controller
            .subchannels
            .iter()
            .map(|sc| sc.address().address.clone())
            .collect();
        assert_eq!(created, addresses.into_iter().collect::<HashSet<_>>());
        assert_eq!(setup.connects().len(), 1);
    }

    #[test]
    fn pickfirst_rejects_config_of_another_policy() {
        let mut setup = Setup::new();
        let config = LbConfig::new(42u32);
        let result =
            setup
                .policy
                .resolver_update(update(&["a:1"]), Some(&config), &mut setup.controller);
        assert!(result.is_err());
        assert!(setup.controller.subchannels.is_empty());
    }

    #[test]
    fn pickfirst_failure_mentions_resolution_note() {
        let mut setup = Setup::new();
        setup.send_update(
            update(&["a:1"]).with_resolution_note("dns answer was truncated"),
            None,
        );
        setup.move_subchannel_to_state("a:1", ConnectivityState::TransientFailure);
        assert!(setup.fail_message().contains("dns answer was truncated"));
    }
}
