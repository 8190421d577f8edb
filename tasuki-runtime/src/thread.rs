//! # Thread Contexts and Access Leases
//!
//! Every thread that locks objects attaches a [`ThreadContext`]. The
//! context carries the thread's identity, its monitor cache and its
//! *access lease*.
//!
//! ## Access lease
//!
//! The reservation fast paths update a reserved word with plain stores.
//! That is only sound if no other thread can change the word at the same
//! time. The only other writer of a word reserved to thread T is a helper
//! cancelling T's reservation, and it does so while holding T's lease.
//! T in turn holds its own lease:
//!
//! - for the duration of every fast-path sequence it runs, and
//! - across the whole body of a primitive locked region, where the word
//!   `T|RESERVED` itself means "held".
//!
//! T never holds its lease while it runs the helper, so a cancelling
//! thread waits at most for one fast-path sequence or one primitive region.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use tracing::trace;

use crate::heap::ObjectRef;
use crate::lockword::ThreadIdentity;
use crate::monitor_cache::{MonitorCache, MonitorRecord};
use crate::stats::ExecStats;

/// A thread's access lease.
pub type Lease = Arc<Mutex<()>>;

// ============================================================================
// Thread Registry
// ============================================================================

/// Leases of all attached threads.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    leases: RwLock<HashMap<ThreadIdentity, Lease>>,
}

impl ThreadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, thread: ThreadIdentity, lease: Lease) {
        self.leases.write().insert(thread, lease);
    }

    fn unregister(&self, thread: ThreadIdentity) {
        self.leases.write().remove(&thread);
    }

    /// The lease of an attached thread. `None` once the thread detached.
    pub fn lease_of(&self, thread: ThreadIdentity) -> Option<Lease> {
        self.leases.read().get(&thread).cloned()
    }

    /// Number of attached threads.
    pub fn len(&self) -> usize {
        self.leases.read().len()
    }

    /// Whether no thread is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Thread Context
// ============================================================================

/// Per-thread state. Bound to the thread that created it.
pub struct ThreadContext {
    identity: ThreadIdentity,
    cache: RefCell<MonitorCache>,
    lease: Lease,
    held: RefCell<Option<ArcMutexGuard<RawMutex, ()>>>,
    primitive_depth: Cell<usize>,
    stats: Cell<ExecStats>,
    registry: Arc<ThreadRegistry>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadContext {
    /// Attach a new thread with a fresh identity.
    pub fn attach(registry: &Arc<ThreadRegistry>, cache_size: usize) -> Self {
        let identity = ThreadIdentity::next();
        let lease: Lease = Arc::new(Mutex::new(()));
        registry.register(identity, Arc::clone(&lease));
        trace!(thread = %identity, "attached thread");
        Self {
            identity,
            cache: RefCell::new(MonitorCache::new(cache_size)),
            lease,
            held: RefCell::new(None),
            primitive_depth: Cell::new(0),
            stats: Cell::new(ExecStats::default()),
            registry: Arc::clone(registry),
            _not_send: PhantomData,
        }
    }

    /// This thread's identity.
    pub fn identity(&self) -> ThreadIdentity {
        self.identity
    }

    // ------------------------------------------------------------------------
    // Lease
    // ------------------------------------------------------------------------

    /// Take this thread's own lease. Blocks while a helper on another thread
    /// is cancelling one of our reservations.
    pub(crate) fn acquire_lease(&self) {
        let mut held = self.held.borrow_mut();
        debug_assert!(held.is_none(), "lease acquired twice");
        if held.is_none() {
            *held = Some(self.lease.lock_arc());
        }
    }

    /// Give the lease back.
    pub(crate) fn release_lease(&self) {
        self.held.borrow_mut().take();
    }

    /// Whether this thread currently holds its lease.
    pub fn holds_lease(&self) -> bool {
        self.held.borrow().is_some()
    }

    pub(crate) fn enter_primitive_region(&self) {
        self.primitive_depth.set(self.primitive_depth.get() + 1);
    }

    pub(crate) fn exit_primitive_region(&self) {
        self.primitive_depth.set(self.primitive_depth.get().saturating_sub(1));
    }

    /// Whether the thread is inside a primitive locked region.
    pub fn in_primitive_region(&self) -> bool {
        self.primitive_depth.get() > 0
    }

    // ------------------------------------------------------------------------
    // Monitor cache
    // ------------------------------------------------------------------------

    /// Look up the cached monitor record of `object`.
    pub fn lookup_monitor(&self, object: &ObjectRef) -> Option<Arc<MonitorRecord>> {
        self.cache.borrow().lookup(object)
    }

    /// Probe one cache slot for `address`.
    pub(crate) fn probe_cache(&self, index: usize, address: usize) -> Option<Arc<MonitorRecord>> {
        self.cache.borrow().probe(index, address).cloned()
    }

    /// Cache index of an object address.
    pub(crate) fn cache_index(&self, address: usize) -> usize {
        self.cache.borrow().index_for(address)
    }

    /// Install a record in the cache.
    pub fn cache_monitor(&self, record: Arc<MonitorRecord>) {
        self.cache.borrow_mut().insert(record);
    }

    /// Number of occupied cache slots.
    pub fn cached_monitors(&self) -> usize {
        self.cache.borrow().occupied()
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    /// Operations executed by this thread's fast paths so far.
    pub fn stats(&self) -> ExecStats {
        self.stats.get()
    }

    /// Clear the operation counts.
    pub fn reset_stats(&self) {
        self.stats.set(ExecStats::default());
    }

    pub(crate) fn record(&self, stats: ExecStats) {
        self.stats.set(self.stats.get() + stats);
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.held.get_mut().take();
        self.registry.unregister(self.identity);
        trace!(thread = %self.identity, "detached thread");
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("identity", &self.identity)
            .field("holds_lease", &self.holds_lease())
            .field("primitive_depth", &self.primitive_depth.get())
            .finish()
    }
}
