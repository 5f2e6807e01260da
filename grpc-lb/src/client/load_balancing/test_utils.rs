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

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    Pick, PickArgs, PickId, PickOutcome, PickRequest, PickResult, Picker, SubchannelState,
    WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::client::subchannel::{
    Subchannel, SubchannelArgs, SubchannelFactory, SubchannelPool, SubchannelRef,
    SubchannelWatcher,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TestEvent {
    NewSubchannel(Address),
    Connect(Address),
    ResetBackoff(Address),
    ScheduleWork,
}

struct FakeSubchannelInner {
    state: SubchannelState,
    watchers: Vec<SubchannelWatcher>,
}

// A test subchannel whose state is driven by the test.  Calls to connect and
// reset_backoff are forwarded to the test's event channel.
pub(crate) struct FakeSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
    inner: Mutex<FakeSubchannelInner>,
}

impl FakeSubchannel {
    pub(crate) fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            address,
            tx_events,
            inner: Mutex::new(FakeSubchannelInner {
                state: SubchannelState::new(ConnectivityState::Idle),
                watchers: Vec::new(),
            }),
        }
    }

    /// Moves the subchannel to `state`, firing its watchers outside of the
    /// lock.
    pub(crate) fn set_state(&self, state: SubchannelState) {
        let watchers = {
            let mut inner = self.inner.lock();
            let changed = inner.state.connectivity_state != state.connectivity_state;
            inner.state = state.clone();
            if !changed {
                return;
            }
            std::mem::take(&mut inner.watchers)
        };
        for watcher in watchers {
            watcher(state.clone());
        }
    }

    pub(crate) fn set_connectivity_state(&self, state: ConnectivityState) {
        self.set_state(SubchannelState::new(state));
    }

    pub(crate) fn set_transient_failure(&self, error: &str) {
        let error: Box<dyn Error + Send + Sync> = error.into();
        self.set_state(SubchannelState::transient_failure(Arc::from(error)));
    }
}

impl Subchannel for FakeSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn state(&self) -> SubchannelState {
        self.inner.lock().state.clone()
    }

    fn watch_state(&self, expected: ConnectivityState, watcher: SubchannelWatcher) {
        let mut inner = self.inner.lock();
        if inner.state.connectivity_state == expected {
            inner.watchers.push(watcher);
            return;
        }
        let state = inner.state.clone();
        drop(inner);
        watcher(state);
    }

    fn connect(&self) {
        let _ = self.tx_events.send(TestEvent::Connect(self.address.clone()));
    }

    fn reset_backoff(&self) {
        let _ = self
            .tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()));
    }
}

/// Creates [`FakeSubchannel`]s and lets tests look them up by address.
pub(crate) struct FakeSubchannelFactory {
    tx_events: mpsc::UnboundedSender<TestEvent>,
    subchannels: Mutex<HashMap<Address, Weak<FakeSubchannel>>>,
    created: AtomicUsize,
}

impl FakeSubchannelFactory {
    pub(crate) fn new(tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            tx_events,
            subchannels: Mutex::default(),
            created: AtomicUsize::new(0),
        }
    }

    /// The number of subchannels created so far.
    pub(crate) fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Returns the live subchannel most recently created for `address`.
    pub(crate) fn subchannel(&self, address: &Address) -> Arc<FakeSubchannel> {
        self.subchannels
            .lock()
            .get(address)
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| panic!("no live subchannel for {address}"))
    }
}

impl SubchannelFactory for FakeSubchannelFactory {
    fn create_subchannel(&self, address: &Address, _args: &SubchannelArgs) -> Arc<dyn Subchannel> {
        let subchannel = Arc::new(FakeSubchannel::new(
            address.clone(),
            self.tx_events.clone(),
        ));
        self.subchannels
            .lock()
            .insert(address.clone(), Arc::downgrade(&subchannel));
        self.created.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .tx_events
            .send(TestEvent::NewSubchannel(address.clone()));
        subchannel
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

/// A test channel controller that hands out subchannels from a private pool
/// and records what the policy asked for.
pub(crate) struct TestChannelController {
    pub(crate) pool: Arc<SubchannelPool>,
    pub(crate) subchannels: Vec<SubchannelRef>,
    pub(crate) pickers: Vec<LbState>,
    pub(crate) resolution_requests: usize,
}

impl TestChannelController {
    pub(crate) fn new(factory: Arc<FakeSubchannelFactory>) -> Self {
        Self {
            pool: SubchannelPool::new(factory),
            subchannels: Vec::new(),
            pickers: Vec::new(),
            resolution_requests: 0,
        }
    }

    /// The reference most recently handed out for `address`.
    pub(crate) fn subchannel(&self, address: &str) -> SubchannelRef {
        let address = Address::tcp(address);
        self.subchannels
            .iter()
            .rev()
            .find(|sc| *sc.address() == address)
            .cloned()
            .unwrap_or_else(|| panic!("no subchannel created for {address}"))
    }

    /// The connectivity state of the most recent picker update.
    pub(crate) fn last_state(&self) -> Option<ConnectivityState> {
        self.pickers.last().map(|state| state.connectivity_state)
    }

    /// Picks from the most recent picker update.
    pub(crate) fn pick(&self) -> PickResult {
        let picker = &self
            .pickers
            .last()
            .expect("no picker has been published")
            .picker;
        picker.pick(&PickArgs {
            metadata: &MetadataMap::new(),
            flags: 0,
        })
    }

    /// Picks from the most recent picker and returns the picked address.
    pub(crate) fn pick_address(&self) -> String {
        match self.pick() {
            PickResult::Pick(pick) => pick.subchannel.address().address.clone(),
            other => panic!("expected a pick, got {other}"),
        }
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> SubchannelRef {
        let subchannel = self.pool.acquire(address, &SubchannelArgs::default());
        self.subchannels.push(subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.pickers.push(update);
    }

    fn request_resolution(&mut self) {
        self.resolution_requests += 1;
    }
}

/// This struct holds `LbPolicy` trait stub functions that tests are expected to implement.
#[derive(Clone, Default)]
pub(crate) struct PolicyFuncs {
    pub(crate) resolver_update: Option<
        Arc<
            dyn Fn(
                    &mut Data,
                    ResolverUpdate,
                    Option<&LbConfig>,
                    &mut dyn ChannelController,
                ) -> Result<(), Box<dyn Error + Send + Sync>>
                + Send
                + Sync,
        >,
    >,
    pub(crate) subchannel_update: Option<
        Arc<
            dyn Fn(&mut Data, &SubchannelRef, &SubchannelState, &mut dyn ChannelController)
                + Send
                + Sync,
        >,
    >,
    pub(crate) exit_idle: Option<Arc<dyn Fn(&mut Data, &mut dyn ChannelController) + Send + Sync>>,
    pub(crate) work: Option<Arc<dyn Fn(&mut Data, &mut dyn ChannelController) + Send + Sync>>,
}

impl PolicyFuncs {
    pub(crate) fn with_resolver_update(
        mut self,
        f: impl Fn(
            &mut Data,
            ResolverUpdate,
            Option<&LbConfig>,
            &mut dyn ChannelController,
        ) -> Result<(), Box<dyn Error + Send + Sync>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.resolver_update = Some(Arc::new(f));
        self
    }

    pub(crate) fn with_subchannel_update(
        mut self,
        f: impl Fn(&mut Data, &SubchannelRef, &SubchannelState, &mut dyn ChannelController)
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.subchannel_update = Some(Arc::new(f));
        self
    }

    pub(crate) fn with_exit_idle(
        mut self,
        f: impl Fn(&mut Data, &mut dyn ChannelController) + Send + Sync + 'static,
    ) -> Self {
        self.exit_idle = Some(Arc::new(f));
        self
    }

    pub(crate) fn with_work(
        mut self,
        f: impl Fn(&mut Data, &mut dyn ChannelController) + Send + Sync + 'static,
    ) -> Self {
        self.work = Some(Arc::new(f));
        self
    }
}

/// Data holds test data that will be passed all to functions in PolicyFuncs
pub(crate) struct Data {
    pub(crate) test_data: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) work_scheduler: Arc<dyn WorkScheduler>,
}

impl Data {
    /// Returns the test data as a `T`, creating a default one on first use.
    pub(crate) fn get_or_default<T: Any + Default + Send + Sync>(&mut self) -> &mut T {
        self.test_data
            .get_or_insert_with(|| Box::new(T::default()))
            .downcast_mut::<T>()
            .expect("test data has a different type")
    }
}

/// The stub `LbPolicy` that calls the provided functions.
pub(crate) struct StubPolicy {
    funcs: PolicyFuncs,
    data: Data,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(f) = &self.funcs.resolver_update {
            return f(&mut self.data, update, config, channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: &SubchannelRef,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(f) = &self.funcs.subchannel_update {
            f(&mut self.data, subchannel, state, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.exit_idle {
            f(&mut self.data, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.work {
            f(&mut self.data, channel_controller);
        }
    }
}

/// This StubPolicyBuilder builds a StubPolicy.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    funcs: PolicyFuncs,
}

impl StubPolicyBuilder {
    pub(crate) fn new(name: &'static str, funcs: PolicyFuncs) -> Self {
        Self { name, funcs }
    }
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(StubPolicy {
            funcs: self.funcs.clone(),
            data: Data {
                test_data: None,
                work_scheduler: options.work_scheduler,
            },
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        #[derive(serde::Deserialize)]
        struct StubConfig {
            #[serde(default)]
            valid: bool,
        }
        let cfg: StubConfig = config.convert_to()?;
        if !cfg.valid {
            return Err("stub config must set \"valid\"".into());
        }
        Ok(Some(LbConfig::new(cfg.valid)))
    }
}

/// Registers a stub policy under `name` in the global registry.
pub(crate) fn reg_stub_policy(name: &'static str, funcs: PolicyFuncs) {
    GLOBAL_LB_REGISTRY.add_builder(StubPolicyBuilder::new(name, funcs))
}

/// A picker that picks `subchannel` a limited number of times and queues
/// every pick after that.
pub(crate) struct BudgetPicker {
    pub(crate) subchannel: SubchannelRef,
    pub(crate) budget: AtomicUsize,
}

impl BudgetPicker {
    pub(crate) fn new(subchannel: SubchannelRef, budget: usize) -> Self {
        Self {
            subchannel,
            budget: AtomicUsize::new(budget),
        }
    }
}

impl Picker for BudgetPicker {
    fn pick(&self, _request: &PickArgs<'_>) -> PickResult {
        let spent = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
                budget.checked_sub(1)
            });
        match spent {
            Ok(_) => PickResult::Pick(Pick::new(self.subchannel.clone())),
            Err(_) => PickResult::Queue,
        }
    }
}

/// Builds a pick request whose completion is reported on `tx` together with
/// the pick's id.
pub(crate) fn recorded_pick(
    tx: &mpsc::UnboundedSender<(PickId, PickOutcome)>,
    flags: u32,
) -> PickRequest {
    let request = PickRequest::new(MetadataMap::new()).with_flags(flags);
    let id = request.id();
    let tx = tx.clone();
    request.with_completion(move |outcome| {
        let _ = tx.send((id, outcome));
    })
}

/// Returns every event currently queued on `rx`.
pub(crate) fn drain_events(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Vec<TestEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
