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

//! The load balancing policy contract and the framework that hosts it.
//!
//! Concrete balancing algorithms implement [`LbPolicy`] and describe their
//! current view of the world to the channel through [`LbState`] updates,
//! each carrying a [`Picker`].  The algorithm-agnostic [`LoadBalancer`] wraps
//! one algorithm instance and implements everything the channel relies on:
//! the pick protocol with its queue of pending picks, cancellation, the
//! aggregate connectivity state and its watchers, re-resolution throttling,
//! diagnostics and the hand-off of pending picks to a successor policy.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::client::subchannel::SubchannelRef;

pub use crate::client::subchannel::SubchannelState;

mod child_refs;
mod load_balancer;
mod pending_picks;
pub mod pick_first;
mod registry;
mod reresolution;
pub mod round_robin;
#[cfg(test)]
pub(crate) mod test_utils;

pub use child_refs::{ChildRefs, ChildRefsHandle};
pub use load_balancer::{LoadBalancer, LoadBalancerOptions};
pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

/// Bits of a pick's flags word.  Flags are opaque to the framework except for
/// cancellation matching and the bits defined here.
pub mod flags {
    /// The call waits for a connection instead of failing when the picker
    /// reports a transient failure.
    pub const WAIT_FOR_READY: u32 = 0x0000_0020;
}

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request a call into its work method.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.  Every method runs confined to the owning channel's work serializer.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new configuration.
    ///
    /// A policy must validate the update before acting on it: when it returns
    /// an error, it must still be operating on its previous update.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: &SubchannelRef,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    /// Asks the policy to leave IDLE and start connecting.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called after the reconnect backoff of every subchannel handed to the
    /// policy has been reset.
    fn reset_backoff(&mut self, _channel_controller: &mut dyn ChannelController) {}
}

/// Controls channel behaviors.
pub trait ChannelController {
    /// Returns a counted reference to the pooled subchannel for `address`.
    /// The reference is released when the policy drops it.
    fn new_subchannel(&mut self, address: &Address) -> SubchannelRef;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.  Requests are throttled by the channel.
    fn request_resolution(&mut self);

    /// Reports the identifiers of channels or nested policies the policy
    /// owns, for diagnostics.  Subchannels are tracked automatically.
    fn set_child_channels(&mut self, _channels: Vec<u64>) {}
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// The per-call data a picker sees.
pub struct PickArgs<'a> {
    /// The call's initial metadata.
    pub metadata: &'a MetadataMap,
    /// The call's flags word, see [`flags`].
    pub flags: u32,
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  If pick() returns Queue, the request waits until the LbPolicy
/// produces a new Picker, and pick() is called on the new Picker for it.
///
/// Pickers are always paired with a ConnectivityState:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail with an error that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue.
    fn pick(&self, request: &PickArgs<'_>) -> PickResult;

    /// The error that explains the state this picker is published with.
    /// Pickers for TransientFailure should report why connections fail; it
    /// is surfaced to the channel together with the connectivity state.
    fn connectivity_status(&self) -> Option<Status> {
        None
    }
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status.
    /// If the request is wait-for-ready, it is kept queued instead and
    /// attempted on the next picker.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if it is wait-for-ready.
    Drop(Status),
}

impl PartialEq for PickResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PickResult::Pick(a), PickResult::Pick(b)) => a.subchannel == b.subchannel,
            (PickResult::Queue, PickResult::Queue) => true,
            (PickResult::Fail(a), PickResult::Fail(b)) | (PickResult::Drop(a), PickResult::Drop(b)) => {
                a.code() == b.code() && a.message() == b.message()
            }
            _ => false,
        }
    }
}

impl Display for PickResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            Self::Queue => write!(f, "Queue"),
            Self::Fail(st) => write!(f, "Fail({st})"),
            Self::Drop(st) => write!(f, "Drop({st})"),
        }
    }
}

/// Invoked once with the final status of a call routed by a [`Pick`].
pub type CallCompletion = Box<dyn FnOnce(&Status) + Send>;

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.  The reference keeps the subchannel in
    /// the pool for as long as the call holds it.
    pub subchannel: SubchannelRef,
    // Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
    on_call_complete: Option<CallCompletion>,
}

impl Pick {
    pub fn new(subchannel: SubchannelRef) -> Self {
        Self {
            subchannel,
            metadata: MetadataMap::new(),
            on_call_complete: None,
        }
    }

    /// Lets the policy observe how the call it routed finished, e.g. for load
    /// reporting or outlier tracking.  The hook runs on whatever thread
    /// finishes the call, outside of the serializer.
    pub fn with_on_call_complete(mut self, f: impl FnOnce(&Status) + Send + 'static) -> Self {
        self.on_call_complete = Some(Box::new(f));
        self
    }

    /// Reports the final status of the call.  Only the first report reaches
    /// the policy.
    pub fn complete_call(&mut self, status: &Status) {
        if let Some(on_call_complete) = self.on_call_complete.take() {
            on_call_complete(status);
        }
    }
}

impl fmt::Debug for Pick {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pick")
            .field("subchannel", &self.subchannel)
            .field("metadata", &self.metadata)
            .field("on_call_complete", &self.on_call_complete.is_some())
            .finish()
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// Failing fails every pick with UNAVAILABLE and the given error.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &PickArgs<'_>) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }

    fn connectivity_status(&self) -> Option<Status> {
        Some(Status::unavailable(self.error.clone()))
    }
}

/// Identifies a pick request for its whole life, across hand-offs between
/// policy instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PickId(u64);

impl PickId {
    fn next() -> Self {
        static NEXT_PICK_ID: AtomicU64 = AtomicU64::new(1);
        PickId(NEXT_PICK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for PickId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "pick-{}", self.0)
    }
}

/// Why a pick produced no connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PickError {
    /// No address can satisfy the pick now.
    #[error("pick failed: {0}")]
    Failed(Status),
    /// The policy dropped the call on purpose, e.g. for load shedding.
    #[error("pick dropped: {0}")]
    Dropped(Status),
    /// The caller cancelled the pick while it was queued.
    #[error("pick cancelled: {0}")]
    Cancelled(Status),
    /// The policy shut down while the pick was queued, or before it started.
    #[error("load balancing policy shut down")]
    Shutdown,
}

impl PickError {
    /// Cancellations are the caller's own doing and must not be retried.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PickError::Cancelled(_))
    }

    /// Converts the error into the status the call fails with.
    pub fn to_status(&self) -> Status {
        match self {
            PickError::Failed(st) | PickError::Dropped(st) | PickError::Cancelled(st) => st.clone(),
            PickError::Shutdown => Status::unavailable("load balancing policy shut down"),
        }
    }
}

/// The final result of a pick: a connection or the reason there is none.
pub type PickOutcome = Result<Pick, PickError>;

/// The completion slot of a pick that may be answered asynchronously.
pub type PickCallback = Box<dyn FnOnce(PickOutcome) + Send>;

/// One call's attempt to obtain a connection.
pub struct PickRequest {
    id: PickId,
    metadata: MetadataMap,
    flags: u32,
    on_complete: Option<PickCallback>,
}

impl PickRequest {
    /// Creates a request that can only be answered synchronously.
    pub fn new(metadata: MetadataMap) -> Self {
        Self {
            id: PickId::next(),
            metadata,
            flags: 0,
            on_complete: None,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Allows the request to wait for a connection.  `on_complete` runs
    /// exactly once, from the serializer, unless the pick completes
    /// synchronously.
    pub fn with_completion(mut self, on_complete: impl FnOnce(PickOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }

    pub fn id(&self) -> PickId {
        self.id
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

/// What [`LoadBalancer::pick`] did with a request.
#[derive(Debug)]
pub enum PickProgress {
    /// The pick finished synchronously; its completion slot will never run.
    Done(PickOutcome),
    /// The pick is queued; its completion slot runs later.
    Pending(PickId),
}

/// Errors reported synchronously when creating or updating a policy.
#[derive(Debug, thiserror::Error)]
pub enum LbError {
    #[error("load balancing policy {0:?} is not registered")]
    UnknownPolicy(String),
    #[error("invalid configuration for load balancing policy {policy}: {reason}")]
    InvalidConfig { policy: String, reason: String },
    #[error("load balancing policy {policy} rejected the resolver update: {reason}")]
    Rejected { policy: &'static str, reason: String },
    #[error("channel is shut down")]
    ChannelShutdown,
}
