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

//! Subchannels and the pool that shares them between policies.
//!
//! A subchannel is a connection to one resolved address.  The connection
//! machinery itself lives outside this crate behind the [`Subchannel`] trait;
//! this module deduplicates subchannels by [`SubchannelKey`] so that every
//! policy instance on a channel, including an outgoing and an incoming policy
//! during a switch, reuses the same underlying connection.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::ConnectivityState;
use super::name_resolution::Address;

/// Represents the current state of a Subchannel.
#[derive(Clone)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See [`Subchannel`] for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }

    pub fn transient_failure(error: Arc<dyn Error + Send + Sync>) -> Self {
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(error),
        }
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({})", self.connectivity_state, err),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

impl Debug for SubchannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A single-shot callback invoked with the subchannel's new state.
pub type SubchannelWatcher = Box<dyn FnOnce(SubchannelState) + Send>;

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when connect() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to CONNECTING when the reconnect backoff
///   timer has expired.
///
/// Implementations may fire watchers from any thread, including inline from
/// `watch_state` when the expected state is already stale.
pub trait Subchannel: Send + Sync {
    /// The address this subchannel connects to.
    fn address(&self) -> Address;

    /// The current state of the subchannel.  Never blocks.
    fn state(&self) -> SubchannelState;

    /// Registers `watcher` to fire exactly once, on the next change away from
    /// `expected`, or immediately if the current state differs from it.
    fn watch_state(&self, expected: ConnectivityState, watcher: SubchannelWatcher);

    /// Starts connecting if the subchannel is IDLE.
    fn connect(&self);

    /// Skips any pending reconnect backoff.
    fn reset_backoff(&self);
}

/// Creates the connection object behind a pool entry on first use of a key.
pub trait SubchannelFactory: Send + Sync {
    fn create_subchannel(&self, address: &Address, args: &SubchannelArgs) -> Arc<dyn Subchannel>;
}

/// Connection arguments that distinguish otherwise identical subchannels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchannelArgs {
    args: BTreeMap<String, String>,
}

impl SubchannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// The identity of a pooled subchannel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubchannelKey {
    pub address: Address,
    pub args: SubchannelArgs,
}

/// A pool-assigned identifier, unique for the lifetime of the pool.  Exported
/// to diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchannelId(u64);

impl SubchannelId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for SubchannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "subchannel-{}", self.0)
    }
}

struct PoolEntry {
    id: SubchannelId,
    subchannel: Arc<dyn Subchannel>,
    refs: usize,
}

/// A registry of subchannels shared by every policy instance of a channel.
///
/// The pool is the one load balancing structure used across serializer
/// boundaries, so it carries its own lock.  The lock is held only for map
/// operations and for the factory call on first use of a key.
pub struct SubchannelPool {
    factory: Arc<dyn SubchannelFactory>,
    entries: Mutex<HashMap<SubchannelKey, PoolEntry>>,
    next_id: AtomicU64,
}

impl SubchannelPool {
    pub fn new(factory: Arc<dyn SubchannelFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Returns a counted reference to the subchannel for `address` and
    /// `args`, creating it if this is the first reference to the key.
    pub fn acquire(self: &Arc<Self>, address: &Address, args: &SubchannelArgs) -> SubchannelRef {
        let key = SubchannelKey {
            address: address.clone(),
            args: args.clone(),
        };
        let (id, subchannel) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| {
                let id = SubchannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
                tracing::debug!(%id, %address, "creating pooled subchannel");
                PoolEntry {
                    id,
                    subchannel: self.factory.create_subchannel(address, args),
                    refs: 0,
                }
            });
            entry.refs += 1;
            (entry.id, entry.subchannel.clone())
        };
        SubchannelRef {
            inner: Arc::new(RefInner {
                id,
                key,
                subchannel,
                pool: self.clone(),
            }),
        }
    }

    /// Gives a reference back to the pool.  Equivalent to dropping it: the
    /// reference is counted once no matter how many clones of it exist.
    pub fn release(&self, subchannel: SubchannelRef) {
        drop(subchannel);
    }

    /// The number of outstanding references to `key`.
    pub fn ref_count(&self, key: &SubchannelKey) -> usize {
        self.entries.lock().get(key).map_or(0, |entry| entry.refs)
    }

    /// The number of live subchannels in the pool.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unref(&self, key: &SubchannelKey) {
        let removed = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                debug_assert!(false, "released unknown subchannel key {key:?}");
                return;
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                return;
            }
            entries.remove(key)
        };
        // The subchannel is dropped outside of the lock.
        if let Some(entry) = removed {
            tracing::debug!(id = %entry.id, address = %key.address, "destroying pooled subchannel");
        }
    }
}

struct RefInner {
    id: SubchannelId,
    key: SubchannelKey,
    subchannel: Arc<dyn Subchannel>,
    pool: Arc<SubchannelPool>,
}

impl Drop for RefInner {
    fn drop(&mut self) {
        self.pool.unref(&self.key);
    }
}

/// A counted reference to a pooled subchannel.
///
/// Each [`SubchannelPool::acquire`] produces one reference; clones share it.
/// The pool count drops when the last clone is dropped.  Two references are
/// equal only if they come from the same acquire, even when they point at the
/// same subchannel.
#[derive(Clone)]
pub struct SubchannelRef {
    inner: Arc<RefInner>,
}

impl SubchannelRef {
    pub fn id(&self) -> SubchannelId {
        self.inner.id
    }

    pub fn key(&self) -> &SubchannelKey {
        &self.inner.key
    }

    pub fn address(&self) -> &Address {
        &self.inner.key.address
    }

    pub fn subchannel(&self) -> &Arc<dyn Subchannel> {
        &self.inner.subchannel
    }

    pub fn connect(&self) {
        self.inner.subchannel.connect()
    }

    pub fn state(&self) -> SubchannelState {
        self.inner.subchannel.state()
    }

    pub(crate) fn downgrade(&self) -> WeakSubchannelRef {
        WeakSubchannelRef {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl PartialEq for SubchannelRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SubchannelRef {}

impl Hash for SubchannelRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl Display for SubchannelRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.inner.id, self.inner.key.address)
    }
}

impl Debug for SubchannelRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A non-counting handle to a [`SubchannelRef`], used to route subchannel
/// events without keeping the reference alive.
#[derive(Clone)]
pub(crate) struct WeakSubchannelRef {
    id: SubchannelId,
    inner: Weak<RefInner>,
}

impl WeakSubchannelRef {
    pub(crate) fn id(&self) -> SubchannelId {
        self.id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<SubchannelRef> {
        self.inner.upgrade().map(|inner| SubchannelRef { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::{SubchannelArgs, SubchannelKey, SubchannelPool};
    use crate::client::load_balancing::test_utils::FakeSubchannelFactory;
    use crate::client::name_resolution::Address;

    fn setup() -> (Arc<SubchannelPool>, Arc<FakeSubchannelFactory>) {
        let (tx_events, _rx_events) = mpsc::unbounded_channel();
        let factory = Arc::new(FakeSubchannelFactory::new(tx_events));
        (SubchannelPool::new(factory.clone()), factory)
    }

    fn key(address: &Address) -> SubchannelKey {
        SubchannelKey {
            address: address.clone(),
            args: SubchannelArgs::default(),
        }
    }

    #[test]
    fn acquire_deduplicates_by_key() {
        let (pool, factory) = setup();
        let addr = Address::tcp("10.0.0.1:443");

        let first = pool.acquire(&addr, &SubchannelArgs::default());
        let second = pool.acquire(&addr, &SubchannelArgs::default());
        assert_eq!(factory.created_count(), 1);
        assert_eq!(first.id(), second.id());
        assert!(Arc::ptr_eq(first.subchannel(), second.subchannel()));
        assert_ne!(first, second, "separate acquires are separate references");
        assert_eq!(pool.ref_count(&key(&addr)), 2);
    }

    #[test]
    fn args_are_part_of_the_key() {
        let (pool, factory) = setup();
        let addr = Address::tcp("10.0.0.1:443");

        let plain = pool.acquire(&addr, &SubchannelArgs::default());
        let tuned = pool.acquire(&addr, &SubchannelArgs::new().with("max_frame", "32768"));
        assert_eq!(factory.created_count(), 2);
        assert_ne!(plain.id(), tuned.id());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn last_release_destroys_the_subchannel() {
        let (pool, _factory) = setup();
        let addr = Address::tcp("10.0.0.1:443");

        let first = pool.acquire(&addr, &SubchannelArgs::default());
        let clone = first.clone();
        let second = pool.acquire(&addr, &SubchannelArgs::default());
        let weak = Arc::downgrade(first.subchannel());

        pool.release(first);
        assert_eq!(pool.ref_count(&key(&addr)), 2, "a live clone keeps the reference");
        drop(clone);
        assert_eq!(pool.ref_count(&key(&addr)), 1);
        pool.release(second);
        assert_eq!(pool.ref_count(&key(&addr)), 0);
        assert!(pool.is_empty());
        assert!(weak.upgrade().is_none(), "the connection object must be dropped");
    }

    #[test]
    fn reacquire_after_destroy_creates_a_new_subchannel() {
        let (pool, factory) = setup();
        let addr = Address::tcp("10.0.0.1:443");

        let first_id = pool.acquire(&addr, &SubchannelArgs::default()).id();
        let second_id = pool.acquire(&addr, &SubchannelArgs::default()).id();
        assert_ne!(first_id, second_id);
        assert_eq!(factory.created_count(), 2);
    }

    #[test]
    fn concurrent_acquire_and_release() {
        let (pool, _factory) = setup();
        let addresses: Vec<Address> = (0..4)
            .map(|i| Address::tcp(format!("10.0.0.{i}:443")))
            .collect();

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                let addresses = addresses.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let addr = &addresses[(t + i) % addresses.len()];
                        let held = pool.acquire(addr, &SubchannelArgs::default());
                        let again = pool.acquire(addr, &SubchannelArgs::default());
                        assert_eq!(held.id(), again.id());
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(pool.is_empty());
    }
}
