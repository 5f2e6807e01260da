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

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tonic::Status;
use tonic::metadata::MetadataMap;

use super::child_refs::{ChildRefs, ChildRefsHandle};
use super::pending_picks::{PendingPicks, QueuedPick};
use super::reresolution::ReresolutionThrottle;
use super::{
    ChannelController, Failing, LbError, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    PickArgs, PickError, PickId, PickOutcome, PickProgress, PickRequest, PickResult, Picker,
    WorkScheduler,
};
use super::flags::WAIT_FOR_READY;
use crate::client::ConnectivityState;
use crate::client::connectivity_state::{ConnectivityStateTracker, StateWatcher};
use crate::client::name_resolution::{Address, ResolutionRequest, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::client::subchannel::{
    SubchannelArgs, SubchannelPool, SubchannelRef, SubchannelState, WeakSubchannelRef,
};

/// The collaborators a [`LoadBalancer`] is created with.
pub struct LoadBalancerOptions {
    /// The pool shared by every policy instance of the channel.
    pub subchannel_pool: Arc<SubchannelPool>,
    /// Schedules a call to [`LoadBalancer::work`] on the owning serializer.
    pub work_scheduler: Arc<dyn WorkScheduler>,
    /// The initial re-resolution handle, if the channel supports it.
    pub resolution_request: Option<ResolutionRequest>,
}

/// One instance of a load balancing policy for one configuration epoch.
///
/// A `LoadBalancer` wraps a balancing algorithm ([`LbPolicy`]) and provides
/// the parts of the policy contract that do not depend on the algorithm: the
/// queue of pending picks and its draining, cancellation, the aggregate
/// connectivity state and its watchers, the re-resolution throttle, the
/// diagnostics snapshot and the hand-off of pending picks to a successor.
///
/// Every method takes `&mut self`; the owner confines the instance to its work
/// serializer.  Callbacks handed to the instance (pick completions, state
/// watchers and the re-resolution handle) are invoked from inside these
/// methods and must not call back into the instance.
pub struct LoadBalancer {
    name: &'static str,
    builder: Arc<dyn LbPolicyBuilder>,
    policy: Option<Box<dyn LbPolicy>>,
    picker: Arc<dyn Picker>,
    state: ConnectivityStateTracker,
    pending: PendingPicks,
    reresolution: ReresolutionThrottle,
    pool: Arc<SubchannelPool>,
    args: SubchannelArgs,
    subchannels: Vec<WeakSubchannelRef>,
    child_channels: Vec<u64>,
    child_refs: ChildRefsHandle,
    events_tx: mpsc::UnboundedSender<SubchannelEvent>,
    events_rx: mpsc::UnboundedReceiver<SubchannelEvent>,
    deferred: VecDeque<Box<dyn FnOnce() + Send>>,
    work_scheduler: Arc<dyn WorkScheduler>,
    policy_work: Arc<PolicyWorkScheduler>,
    drain_requested: bool,
    shut_down: bool,
}

impl LoadBalancer {
    /// Builds a policy instance with `builder` and delivers its first
    /// resolver update.
    ///
    /// An empty address list is a valid update.  Fails if `config` does not
    /// parse or the algorithm rejects the update; the instance is not created
    /// in that case.
    pub fn create(
        builder: Arc<dyn LbPolicyBuilder>,
        config: Option<&ParsedJsonLbConfig>,
        update: ResolverUpdate,
        options: LoadBalancerOptions,
    ) -> Result<Self, LbError> {
        let name = builder.name();
        let config = parse_config(builder.as_ref(), config)?;
        let policy_work = Arc::new(PolicyWorkScheduler {
            requested: AtomicBool::new(false),
            channel: options.work_scheduler.clone(),
        });
        let policy = builder.build(LbPolicyOptions {
            work_scheduler: policy_work.clone(),
        });
        let initial = LbState::initial();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut lb = LoadBalancer {
            name,
            builder,
            policy: Some(policy),
            picker: initial.picker,
            state: ConnectivityStateTracker::new(name, initial.connectivity_state),
            pending: PendingPicks::default(),
            reresolution: ReresolutionThrottle::default(),
            pool: options.subchannel_pool,
            args: SubchannelArgs::default(),
            subchannels: Vec::new(),
            child_channels: Vec::new(),
            child_refs: ChildRefsHandle::default(),
            events_tx,
            events_rx,
            deferred: VecDeque::new(),
            work_scheduler: options.work_scheduler,
            policy_work,
            drain_requested: false,
            shut_down: false,
        };
        if let Some(request) = options.resolution_request {
            lb.reresolution.install(request);
        }
        tracing::debug!(policy = name, "created load balancing policy");
        lb.apply_resolver_update(config, update)?;
        Ok(lb)
    }

    /// Reports the name of the balancing algorithm.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Replaces the active configuration and address list in place.
    ///
    /// Pending picks are kept and re-offered to whatever picker the algorithm
    /// publishes in response.  If the configuration does not parse or the
    /// algorithm rejects the update, the previous configuration stays active
    /// and nothing the algorithm did while handling the update is applied.
    ///
    /// # Panics
    ///
    /// Panics if the instance has been shut down.
    pub fn update(
        &mut self,
        config: Option<&ParsedJsonLbConfig>,
        update: ResolverUpdate,
    ) -> Result<(), LbError> {
        assert!(
            !self.shut_down,
            "update called on shut down load balancing policy {}",
            self.name
        );
        let config = parse_config(self.builder.as_ref(), config)?;
        self.apply_resolver_update(config, update)
    }

    fn apply_resolver_update(
        &mut self,
        config: Option<LbConfig>,
        update: ResolverUpdate,
    ) -> Result<(), LbError> {
        tracing::debug!(
            policy = self.name,
            addresses = update.addresses.len(),
            pending = self.pending.len(),
            "delivering resolver update"
        );
        let prev_args = std::mem::replace(&mut self.args, update.args.clone());
        let Some((result, controller)) = self.invoke_policy(|policy, controller| {
            policy.resolver_update(update, config.as_ref(), controller)
        }) else {
            return Ok(());
        };
        match result {
            Ok(()) => {
                self.apply(controller);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(policy = self.name, error = %err, "resolver update rejected");
                self.args = prev_args;
                // Only the subchannel bookkeeping survives; the references
                // themselves are gone if the algorithm dropped them.
                self.subchannels.extend(controller.new_subchannels);
                self.subchannels.retain(WeakSubchannelRef::is_alive);
                Err(LbError::Rejected {
                    policy: self.name,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Attempts to pick a connection for one call.
    ///
    /// Returns [`PickProgress::Done`] if the current picker answers the pick
    /// immediately; the request's completion slot is dropped without being
    /// invoked.  Otherwise the pick is queued behind every pick already
    /// pending and its completion slot is invoked exactly once later, from a
    /// call on this instance.  A pick that would have to wait but has no
    /// completion slot fails immediately, with the picker's status if the
    /// picker failed it.  Picks handed off to this instance are offered to
    /// the picker before the new one.
    ///
    /// A pick submitted after shutdown fails synchronously with
    /// [`PickError::Shutdown`].
    pub fn pick(&mut self, request: PickRequest) -> PickProgress {
        let PickRequest {
            id,
            metadata,
            flags,
            on_complete,
        } = request;
        if self.shut_down {
            tracing::error!(policy = self.name, %id, "pick on shut down load balancing policy");
            return PickProgress::Done(Err(PickError::Shutdown));
        }
        // Handed-off picks are older than this one and go first.
        if std::mem::take(&mut self.drain_requested) {
            self.drain_pending();
        }
        match decide(self.picker.as_ref(), &metadata, flags) {
            Decision::Complete(outcome) => {
                tracing::trace!(policy = self.name, %id, "pick completed synchronously");
                PickProgress::Done(outcome)
            }
            Decision::Queue { failure } => match on_complete {
                Some(on_complete) => {
                    tracing::trace!(policy = self.name, %id, "queueing pick");
                    self.pending.push_back(
                        id,
                        QueuedPick {
                            metadata,
                            flags,
                            on_complete,
                        },
                    );
                    PickProgress::Pending(id)
                }
                None => {
                    tracing::trace!(policy = self.name, %id, "pick cannot wait; failing");
                    let status = failure.unwrap_or_else(|| {
                        Status::unavailable(
                            "no connection is available and the pick cannot wait for one",
                        )
                    });
                    PickProgress::Done(Err(PickError::Failed(status)))
                }
            },
        }
    }

    /// Cancels a pending pick, completing it with [`PickError::Cancelled`].
    ///
    /// A pick that is not pending, because it already completed or was
    /// already cancelled, is left alone.
    pub fn cancel(&mut self, id: PickId, reason: Status) {
        match self.pending.remove(id) {
            Some(pick) => {
                tracing::trace!(policy = self.name, %id, "cancelling pick");
                (pick.on_complete)(Err(PickError::Cancelled(reason)));
            }
            None => tracing::trace!(policy = self.name, %id, "cancel of a pick that is not pending"),
        }
    }

    /// Cancels every pending pick whose flags, masked with `mask`, equal
    /// `eq`.  The remaining picks keep their order.
    pub fn cancel_matching(&mut self, mask: u32, eq: u32, reason: Status) {
        let cancelled = self.pending.remove_matching(|flags| flags & mask == eq);
        if cancelled.is_empty() {
            return;
        }
        tracing::debug!(
            policy = self.name,
            count = cancelled.len(),
            mask,
            eq,
            "cancelling matching picks"
        );
        for (_, pick) in cancelled {
            (pick.on_complete)(Err(PickError::Cancelled(reason.clone())));
        }
    }

    /// Moves every pending pick into `successor`'s queue, after the picks it
    /// already holds, without completing any of them.  The successor offers
    /// them to its picker from its next call to [`Self::work`], which it
    /// schedules.
    ///
    /// # Panics
    ///
    /// Panics if `successor` has been shut down.
    pub fn hand_off_pending_picks(&mut self, successor: &mut LoadBalancer) {
        assert!(
            !successor.shut_down,
            "hand-off to shut down load balancing policy {}",
            successor.name
        );
        let picks = self.pending.take_all();
        tracing::debug!(
            from = self.name,
            to = successor.name,
            count = picks.len(),
            "handing off pending picks"
        );
        if picks.is_empty() {
            return;
        }
        for (id, pick) in picks {
            successor.pending.push_back(id, pick);
        }
        successor.drain_requested = true;
        successor.work_scheduler.schedule_work();
    }

    /// Returns the aggregate connectivity state.  Never blocks.
    pub fn current_state(&self) -> ConnectivityState {
        self.state.state()
    }

    /// Returns the error that accompanies the current state, typically the
    /// reason for TransientFailure.  Never blocks.
    pub fn connectivity_status(&self) -> Option<Status> {
        self.state.status().cloned()
    }

    /// Registers `watcher` for the next change away from `expected`.
    ///
    /// If the state already differs from `expected`, the watcher fires with
    /// the current state from the next call to [`Self::work`], which is
    /// scheduled.  Otherwise it fires exactly once on the next transition.
    /// After shutdown a stale watcher fires before this method returns.
    pub fn watch(&mut self, expected: ConnectivityState, watcher: StateWatcher) {
        let Some(stale) = self.state.watch(expected, watcher) else {
            return;
        };
        let current = self.state.state();
        if self.shut_down {
            stale(current);
            return;
        }
        self.deferred.push_back(Box::new(move || stale(current)));
        self.work_scheduler.schedule_work();
    }

    /// Fires the installed re-resolution handle, if there is one.  Further
    /// requests are suppressed until [`Self::set_reresolution_request`]
    /// installs a fresh handle.  Returns whether the resolver was signalled.
    pub fn try_request_reresolution(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        self.reresolution.try_request()
    }

    /// Installs a fresh re-resolution handle.  Dropped if the instance has
    /// been shut down.
    ///
    /// # Panics
    ///
    /// Panics if the previous handle has not been consumed.
    pub fn set_reresolution_request(&mut self, request: ResolutionRequest) {
        if self.shut_down {
            return;
        }
        self.reresolution.install(request);
    }

    /// Whether a re-resolution handle is installed and unused.
    pub fn is_reresolution_armed(&self) -> bool {
        self.reresolution.is_armed()
    }

    /// Asks the algorithm to leave IDLE and start connecting.
    ///
    /// # Panics
    ///
    /// Panics if the instance has been shut down.
    pub fn exit_idle(&mut self) {
        assert!(
            !self.shut_down,
            "exit_idle called on shut down load balancing policy {}",
            self.name
        );
        self.run_policy(|policy, controller| policy.exit_idle(controller));
    }

    /// Resets the reconnect backoff of every subchannel the algorithm holds,
    /// then lets the algorithm react.
    pub fn reset_backoff(&mut self) {
        if self.shut_down {
            return;
        }
        for subchannel in self.subchannels.iter().filter_map(WeakSubchannelRef::upgrade) {
            subchannel.subchannel().reset_backoff();
        }
        self.run_policy(|policy, controller| policy.reset_backoff(controller));
    }

    /// Runs the work the instance scheduled through its work scheduler:
    /// stale watchers, subchannel connectivity events, the algorithm's own
    /// work and the re-offering of handed-off picks.
    pub fn work(&mut self) {
        if self.shut_down {
            return;
        }
        while let Some(deferred) = self.deferred.pop_front() {
            deferred();
        }
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_subchannel_event(event);
        }
        if self.policy_work.requested.swap(false, Ordering::AcqRel) {
            self.run_policy(|policy, controller| policy.work(controller));
        }
        if std::mem::take(&mut self.drain_requested) {
            self.drain_pending();
        }
        self.publish_child_refs();
    }

    /// Shuts the instance down.
    ///
    /// Fails every pending pick with [`PickError::Shutdown`], runs watchers
    /// that were waiting to fire, drops the algorithm together with every
    /// subchannel reference it holds, drops the re-resolution handle and
    /// moves to SHUTDOWN, firing every registered watcher a final time.
    /// Calling it again has no effect.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        tracing::debug!(
            policy = self.name,
            pending = self.pending.len(),
            "shutting down load balancing policy"
        );
        self.shut_down = true;
        for (id, pick) in self.pending.take_all() {
            tracing::trace!(policy = self.name, %id, "failing pick on shutdown");
            (pick.on_complete)(Err(PickError::Shutdown));
        }
        while let Some(deferred) = self.deferred.pop_front() {
            deferred();
        }
        self.policy = None;
        self.picker = Arc::new(Failing {
            error: "load balancing policy shut down".to_string(),
        });
        self.subchannels.clear();
        self.child_channels.clear();
        self.events_rx.close();
        while self.events_rx.try_recv().is_ok() {}
        self.reresolution.clear();
        self.state.set_state(ConnectivityState::Shutdown, None);
        self.child_refs.publish(ChildRefs::default());
    }

    /// Returns the current children of the instance.  Owners that need to
    /// read them from outside the serializer use [`Self::child_refs_handle`].
    pub fn list_child_references(&self) -> ChildRefs {
        self.child_refs()
    }

    /// A handle to the children snapshot that can be read from any thread.
    pub fn child_refs_handle(&self) -> ChildRefsHandle {
        self.child_refs.clone()
    }

    /// The number of picks waiting for a connection.
    pub fn pending_picks(&self) -> usize {
        self.pending.len()
    }

    /// Whether the pick `id` is waiting for a connection.
    pub fn is_pending(&self, id: PickId) -> bool {
        self.pending.contains(id)
    }

    fn invoke_policy<R>(
        &mut self,
        f: impl FnOnce(&mut dyn LbPolicy, &mut PolicyController) -> R,
    ) -> Option<(R, PolicyController)> {
        let mut policy = self.policy.take()?;
        let mut controller = PolicyController {
            pool: self.pool.clone(),
            args: self.args.clone(),
            events_tx: self.events_tx.clone(),
            work_scheduler: self.work_scheduler.clone(),
            new_subchannels: Vec::new(),
            picker_updates: Vec::new(),
            resolution_requested: false,
            child_channels: None,
        };
        let result = f(policy.as_mut(), &mut controller);
        self.policy = Some(policy);
        Some((result, controller))
    }

    fn run_policy(&mut self, f: impl FnOnce(&mut dyn LbPolicy, &mut PolicyController)) {
        if let Some(((), controller)) = self.invoke_policy(f) {
            self.apply(controller);
        }
    }

    // Commits what the algorithm asked for while it was running.
    fn apply(&mut self, controller: PolicyController) {
        let PolicyController {
            new_subchannels,
            picker_updates,
            resolution_requested,
            child_channels,
            ..
        } = controller;
        self.subchannels.extend(new_subchannels);
        if let Some(channels) = child_channels {
            self.child_channels = channels;
        }
        let picker_changed = !picker_updates.is_empty();
        for update in picker_updates {
            self.set_lb_state(update);
        }
        if picker_changed {
            self.drain_pending();
        }
        if resolution_requested {
            self.reresolution.try_request();
        }
        self.publish_child_refs();
    }

    fn set_lb_state(&mut self, update: LbState) {
        if update.connectivity_state == ConnectivityState::Shutdown {
            tracing::warn!(policy = self.name, "ignoring SHUTDOWN state published by the algorithm");
            return;
        }
        let status = update.picker.connectivity_status();
        self.picker = update.picker;
        self.state.set_state(update.connectivity_state, status);
    }

    // Offers every pending pick to the current picker, oldest first.  How
    // many complete is up to the picker; the rest stay queued in order.
    fn drain_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let picker = self.picker.clone();
        let mut completed = 0;
        for (id, pick) in self.pending.take_all() {
            match decide(picker.as_ref(), &pick.metadata, pick.flags) {
                Decision::Queue { .. } => self.pending.push_back(id, pick),
                Decision::Complete(outcome) => {
                    completed += 1;
                    (pick.on_complete)(outcome);
                }
            }
        }
        tracing::trace!(
            policy = self.name,
            completed,
            remaining = self.pending.len(),
            "drained pending picks"
        );
    }

    fn handle_subchannel_event(&mut self, event: SubchannelEvent) {
        let Some(subchannel) = event.subchannel.upgrade() else {
            tracing::trace!(
                policy = self.name,
                id = %event.subchannel.id(),
                "dropping event for released subchannel"
            );
            return;
        };
        if event.state.connectivity_state != ConnectivityState::Shutdown {
            watch_subchannel(
                &subchannel,
                event.subchannel,
                event.state.connectivity_state,
                &self.events_tx,
                &self.work_scheduler,
            );
        }
        self.run_policy(|policy, controller| {
            policy.subchannel_update(&subchannel, &event.state, controller)
        });
    }

    fn child_refs(&self) -> ChildRefs {
        ChildRefs {
            subchannels: self
                .subchannels
                .iter()
                .filter(|subchannel| subchannel.is_alive())
                .map(|subchannel| subchannel.id().as_u64())
                .collect(),
            channels: self.child_channels.clone(),
        }
    }

    fn publish_child_refs(&mut self) {
        self.subchannels.retain(WeakSubchannelRef::is_alive);
        self.child_refs.publish(self.child_refs());
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_config(
    builder: &dyn LbPolicyBuilder,
    config: Option<&ParsedJsonLbConfig>,
) -> Result<Option<LbConfig>, LbError> {
    let Some(config) = config else {
        return Ok(None);
    };
    builder
        .parse_config(config)
        .map_err(|err| LbError::InvalidConfig {
            policy: builder.name().to_string(),
            reason: err.to_string(),
        })
}

enum Decision {
    Complete(PickOutcome),
    // `failure` is set when a wait-for-ready pick met a failing picker.
    Queue { failure: Option<Status> },
}

fn decide(picker: &dyn Picker, metadata: &MetadataMap, flags: u32) -> Decision {
    match picker.pick(&PickArgs { metadata, flags }) {
        PickResult::Pick(pick) => Decision::Complete(Ok(pick)),
        PickResult::Queue => Decision::Queue { failure: None },
        PickResult::Fail(status) if flags & WAIT_FOR_READY != 0 => Decision::Queue {
            failure: Some(status),
        },
        PickResult::Fail(status) => Decision::Complete(Err(PickError::Failed(status))),
        PickResult::Drop(status) => Decision::Complete(Err(PickError::Dropped(status))),
    }
}

struct SubchannelEvent {
    subchannel: WeakSubchannelRef,
    state: SubchannelState,
}

// Arms a single-shot watch that routes the next state change of `subchannel`
// back to the instance through its event queue.
fn watch_subchannel(
    subchannel: &SubchannelRef,
    weak: WeakSubchannelRef,
    expected: ConnectivityState,
    events_tx: &mpsc::UnboundedSender<SubchannelEvent>,
    work_scheduler: &Arc<dyn WorkScheduler>,
) {
    let events_tx = events_tx.clone();
    let work_scheduler = work_scheduler.clone();
    subchannel.subchannel().watch_state(
        expected,
        Box::new(move |state| {
            let event = SubchannelEvent {
                subchannel: weak,
                state,
            };
            if events_tx.send(event).is_ok() {
                work_scheduler.schedule_work();
            }
        }),
    );
}

// The work scheduler handed to the algorithm.  It remembers that the
// algorithm asked for work so that `LoadBalancer::work` calls into it only
// when requested.
struct PolicyWorkScheduler {
    requested: AtomicBool,
    channel: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for PolicyWorkScheduler {
    fn schedule_work(&self) {
        self.requested.store(true, Ordering::Release);
        self.channel.schedule_work();
    }
}

// Collects what the algorithm asks of the channel during one call.  Nothing
// is applied until the call returns.
struct PolicyController {
    pool: Arc<SubchannelPool>,
    args: SubchannelArgs,
    events_tx: mpsc::UnboundedSender<SubchannelEvent>,
    work_scheduler: Arc<dyn WorkScheduler>,
    new_subchannels: Vec<WeakSubchannelRef>,
    picker_updates: Vec<LbState>,
    resolution_requested: bool,
    child_channels: Option<Vec<u64>>,
}

impl ChannelController for PolicyController {
    fn new_subchannel(&mut self, address: &Address) -> SubchannelRef {
        let subchannel = self.pool.acquire(address, &self.args);
        let weak = subchannel.downgrade();
        self.new_subchannels.push(weak.clone());
        watch_subchannel(
            &subchannel,
            weak,
            ConnectivityState::Idle,
            &self.events_tx,
            &self.work_scheduler,
        );
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_updates.push(update);
    }

    fn request_resolution(&mut self) {
        self.resolution_requested = true;
    }

    fn set_child_channels(&mut self, channels: Vec<u64>) {
        self.child_channels = Some(channels);
    }
}
