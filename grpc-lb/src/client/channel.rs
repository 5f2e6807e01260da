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

//! The owning-channel side of the load balancing contract.
//!
//! [`LbChannel`] hosts the active [`LoadBalancer`] inside a work serializer,
//! builds policies by name from the global registry, and replaces the active
//! policy when a configuration names a different one.  Callers interact with
//! it from any task; every operation on the balancer itself is queued on the
//! serializer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tonic::Status;
use tonic::metadata::MetadataMap;

use super::ConnectivityState;
use super::load_balancing::{
    ChildRefs, ChildRefsHandle, GLOBAL_LB_REGISTRY, LbError, LbPolicyBuilder, LoadBalancer,
    LoadBalancerOptions, PickError, PickId, PickOutcome, PickProgress, PickRequest,
    WorkScheduler, pick_first, round_robin,
};
use super::name_resolution::{ResolutionRequest, ResolverUpdate};
use super::service_config::ParsedJsonLbConfig;
use super::subchannel::{SubchannelFactory, SubchannelPool};
use super::work_serializer::{WeakWorkSerializer, WorkSerializer};
use crate::rt::default_runtime;

/// The state confined to the channel's serializer.
struct ChannelState {
    lb: Option<LoadBalancer>,
    // Identifies the active balancer; work scheduled by a replaced one is
    // ignored.
    generation: u64,
}

/// What every serialized step of the channel needs besides the confined
/// state.
struct Shared {
    pool: Arc<SubchannelPool>,
    resolver: Arc<dyn Fn() + Send + Sync>,
    serializer: WeakWorkSerializer<ChannelState>,
    child_refs: Arc<ArcSwap<ChildRefsHandle>>,
}

impl Shared {
    fn build(
        &self,
        builder: Arc<dyn LbPolicyBuilder>,
        config: Option<&ParsedJsonLbConfig>,
        update: ResolverUpdate,
        generation: u64,
    ) -> Result<LoadBalancer, LbError> {
        LoadBalancer::create(
            builder,
            config,
            update,
            LoadBalancerOptions {
                subchannel_pool: self.pool.clone(),
                work_scheduler: Arc::new(ChannelWorkScheduler {
                    serializer: self.serializer.clone(),
                    generation,
                    pending: Arc::new(AtomicBool::new(false)),
                }),
                resolution_request: Some(self.resolution_request()),
            },
        )
    }

    fn resolution_request(&self) -> ResolutionRequest {
        let resolver = self.resolver.clone();
        ResolutionRequest::new(move || resolver())
    }

    fn install(
        &self,
        state: &mut ChannelState,
        lb: LoadBalancer,
        generation: u64,
    ) -> Option<LoadBalancer> {
        self.child_refs.store(Arc::new(lb.child_refs_handle()));
        state.generation = generation;
        state.lb.replace(lb)
    }
}

/// Routes a balancer's work requests to its channel's serializer.  Requests
/// made while a call to [`LoadBalancer::work`] is already queued are merged
/// into it.
struct ChannelWorkScheduler {
    serializer: WeakWorkSerializer<ChannelState>,
    generation: u64,
    pending: Arc<AtomicBool>,
}

impl WorkScheduler for ChannelWorkScheduler {
    fn schedule_work(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.pending.clone();
        let generation = self.generation;
        self.serializer.schedule(move |state| {
            pending.store(false, Ordering::Release);
            if state.generation != generation {
                return;
            }
            if let Some(lb) = state.lb.as_mut() {
                lb.work();
            }
        });
    }
}

/// A client channel reduced to its load balancing duties.
///
/// Dropping the channel shuts the active policy down.
pub struct LbChannel {
    serializer: WorkSerializer<ChannelState>,
    shared: Arc<Shared>,
}

impl LbChannel {
    /// Creates a channel running the policy registered as `policy_name` over
    /// the addresses in `update`.  `resolver` is invoked, from the channel's
    /// serializer, whenever the policy asks for re-resolution.
    ///
    /// The built-in `pick_first` and `round_robin` policies are always
    /// registered.
    pub async fn new(
        policy_name: &str,
        config: Option<ParsedJsonLbConfig>,
        update: ResolverUpdate,
        factory: Arc<dyn SubchannelFactory>,
        resolver: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, LbError> {
        pick_first::reg();
        round_robin::reg();
        let builder = lookup(policy_name)?;

        let serializer = WorkSerializer::new(
            ChannelState {
                lb: None,
                generation: 0,
            },
            default_runtime().as_ref(),
        );
        let shared = Arc::new(Shared {
            pool: SubchannelPool::new(factory),
            resolver: Arc::new(resolver),
            serializer: serializer.downgrade(),
            child_refs: Arc::new(ArcSwap::from_pointee(ChildRefsHandle::default())),
        });

        let (tx, rx) = oneshot::channel();
        let step = shared.clone();
        serializer.schedule(move |state| {
            let result = step
                .build(builder, config.as_ref(), update, 1)
                .map(|lb| {
                    step.install(state, lb, 1);
                });
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| LbError::ChannelShutdown)??;
        tracing::debug!(policy = policy_name, "created load balancing channel");
        Ok(Self { serializer, shared })
    }

    /// Delivers a new configuration and address list.
    ///
    /// If `policy_name` names the active policy, it is updated in place and a
    /// fresh re-resolution handle is installed if the previous one was used.
    /// Otherwise a successor policy is built, the pending picks of the active
    /// policy are handed to it, it becomes the active policy and the previous
    /// one is shut down, all in one serialized step.  On error the active
    /// policy and its configuration are left unchanged.
    pub async fn update(
        &self,
        policy_name: &str,
        config: Option<ParsedJsonLbConfig>,
        update: ResolverUpdate,
    ) -> Result<(), LbError> {
        let builder = lookup(policy_name)?;
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        self.serializer.schedule(move |state| {
            let _ = tx.send(update_or_replace(&shared, state, builder, config, update));
        });
        rx.await.map_err(|_| LbError::ChannelShutdown)?
    }

    /// Asks the active policy for a connection for one call.
    ///
    /// The returned handle resolves once the pick completes, fails or is
    /// cancelled.
    pub fn pick(&self, metadata: MetadataMap, flags: u32) -> PickHandle {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let completion = slot.clone();
        let request = PickRequest::new(metadata)
            .with_flags(flags)
            .with_completion(move |outcome| deliver(&completion, outcome));
        let id = request.id();
        // If the serializer has stopped the closure is dropped, and with it
        // the sender; the handle then resolves to a shutdown error.
        self.serializer.schedule(move |state| {
            let outcome = match state.lb.as_mut() {
                Some(lb) => match lb.pick(request) {
                    PickProgress::Done(outcome) => outcome,
                    PickProgress::Pending(_) => return,
                },
                None => Err(PickError::Shutdown),
            };
            deliver(&slot, outcome);
        });
        PickHandle { id, rx }
    }

    /// Cancels the pick `id` if it is still pending.
    pub fn cancel(&self, id: PickId) {
        self.serializer.schedule(move |state| {
            if let Some(lb) = state.lb.as_mut() {
                lb.cancel(id, Status::cancelled("pick cancelled by the caller"));
            }
        });
    }

    /// Cancels every pending pick whose flags, masked with `mask`, equal
    /// `eq`.
    pub fn cancel_matching(&self, mask: u32, eq: u32) {
        self.serializer.schedule(move |state| {
            if let Some(lb) = state.lb.as_mut() {
                lb.cancel_matching(mask, eq, Status::cancelled("picks cancelled by the caller"));
            }
        });
    }

    /// Waits for the channel's connectivity state to differ from `expected`
    /// and returns the new state.  Replacing the active policy does not count
    /// as a change; the watch carries over to the successor.
    pub async fn watch(&self, expected: ConnectivityState) -> ConnectivityState {
        loop {
            let (tx, rx) = oneshot::channel();
            self.serializer.schedule(move |state| match state.lb.as_mut() {
                Some(lb) => lb.watch(
                    expected,
                    Box::new(move |current: ConnectivityState| {
                        let _ = tx.send(Some(current));
                    }),
                ),
                None => {
                    let _ = tx.send(None);
                }
            });
            match rx.await {
                Ok(Some(ConnectivityState::Shutdown)) => continue,
                Ok(Some(state)) => return state,
                Ok(None) | Err(_) => return ConnectivityState::Shutdown,
            }
        }
    }

    /// Returns the connectivity state of the active policy.
    pub async fn connectivity_state(&self) -> ConnectivityState {
        let (tx, rx) = oneshot::channel();
        self.serializer.schedule(move |state| {
            let current = state
                .lb
                .as_ref()
                .map_or(ConnectivityState::Shutdown, LoadBalancer::current_state);
            let _ = tx.send(current);
        });
        rx.await.unwrap_or(ConnectivityState::Shutdown)
    }

    /// Returns the error that accompanies the active policy's state, such as
    /// the reason for TransientFailure.
    pub async fn connectivity_status(&self) -> Option<Status> {
        let (tx, rx) = oneshot::channel();
        self.serializer.schedule(move |state| {
            let _ = tx.send(state.lb.as_ref().and_then(LoadBalancer::connectivity_status));
        });
        rx.await.ok().flatten()
    }

    /// Asks the active policy to start connecting if it is idle.
    pub fn exit_idle(&self) {
        self.serializer.schedule(|state| {
            if let Some(lb) = state.lb.as_mut() {
                lb.exit_idle();
            }
        });
    }

    /// Resets the reconnect backoff of every subchannel of the active policy.
    pub fn reset_backoff(&self) {
        self.serializer.schedule(|state| {
            if let Some(lb) = state.lb.as_mut() {
                lb.reset_backoff();
            }
        });
    }

    /// Returns the children of the active policy.  Never waits for the
    /// serializer.
    pub fn list_child_references(&self) -> Arc<ChildRefs> {
        self.shared.child_refs.load().snapshot()
    }

    /// Shuts the active policy down.  Picks still pending fail with
    /// [`PickError::Shutdown`] and later operations have no effect.
    pub fn shutdown(&self) {
        self.serializer.schedule(|state| {
            if let Some(mut lb) = state.lb.take() {
                tracing::debug!(policy = lb.name(), "shutting down load balancing channel");
                lb.shutdown();
            }
        });
    }
}

impl Drop for LbChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lookup(policy_name: &str) -> Result<Arc<dyn LbPolicyBuilder>, LbError> {
    GLOBAL_LB_REGISTRY
        .get_policy(policy_name)
        .ok_or_else(|| LbError::UnknownPolicy(policy_name.to_string()))
}

fn update_or_replace(
    shared: &Shared,
    state: &mut ChannelState,
    builder: Arc<dyn LbPolicyBuilder>,
    config: Option<ParsedJsonLbConfig>,
    update: ResolverUpdate,
) -> Result<(), LbError> {
    let Some(active) = state.lb.as_mut() else {
        return Err(LbError::ChannelShutdown);
    };
    if active.name() == builder.name() {
        if !active.is_reresolution_armed() {
            active.set_reresolution_request(shared.resolution_request());
        }
        return active.update(config.as_ref(), update);
    }

    let generation = state.generation + 1;
    let mut successor = shared.build(builder, config.as_ref(), update, generation)?;
    tracing::debug!(
        from = active.name(),
        to = successor.name(),
        "switching load balancing policy"
    );
    active.hand_off_pending_picks(&mut successor);
    if let Some(mut donor) = shared.install(state, successor, generation) {
        donor.shutdown();
    }
    Ok(())
}

fn deliver(slot: &Mutex<Option<oneshot::Sender<PickOutcome>>>, outcome: PickOutcome) {
    if let Some(tx) = slot.lock().take() {
        let _ = tx.send(outcome);
    }
}

/// A pick submitted to an [`LbChannel`].  Resolves to the pick's outcome.
#[derive(Debug)]
pub struct PickHandle {
    id: PickId,
    rx: oneshot::Receiver<PickOutcome>,
}

impl PickHandle {
    /// The id to pass to [`LbChannel::cancel`].
    pub fn id(&self) -> PickId {
        self.id
    }
}

impl Future for PickHandle {
    type Output = PickOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PickError::Shutdown)))
    }
}
