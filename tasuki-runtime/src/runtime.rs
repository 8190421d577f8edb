//! # Reference Runtime Helper
//!
//! [`MonitorRuntime`] services every case the fast paths hand over. It only
//! ever changes a lock word with compare-and-swap, so it is correct against
//! any interleaving of fast paths and other helpers.
//!
//! ## Enter
//!
//! | Word | Action |
//! |------|--------|
//! | `0` | CAS to `self\|1` |
//! | owned by self, recursion below max | CAS to `word + 1` |
//! | owned by self, recursion at max | record external depth 1, CAS to set FLC |
//! | owned by self, FLC set | bump external depth |
//! | reserved to another thread | cancel the reservation, retry |
//! | held by another thread | back off, retry |
//!
//! Cancelling a reservation happens under the owner's access lease. The
//! recursion count is kept; an unlocked reservation becomes `0`.
//!
//! ## Exit
//!
//! Not held by self is `IllegalMonitorState`. With FLC set the external
//! depth unwinds first, and FLC is cleared by CAS when it reaches its last
//! level. Otherwise the recursion count drops by CAS, and the last exit
//! leaves `0`, or `self|RESERVED` if the word was reserved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use tracing::{debug, trace};

use crate::bridge::RuntimeHelper;
use crate::error::{MonitorError, MonitorResult};
use crate::heap::ObjectRef;
use crate::lockword::bits::{FLC, INC, MAX_RECURSION, RESERVED};
use crate::lockword::{LockWord, ThreadIdentity};
use crate::monitor_cache::{MonitorRecord, MonitorTable};
use crate::stats::MonitorStats;
use crate::thread::{ThreadContext, ThreadRegistry};

/// Where the helper found the lock word.
enum LockSlot<'a> {
    Embedded(&'a AtomicUsize),
    Record(Arc<MonitorRecord>),
}

impl LockSlot<'_> {
    fn word(&self) -> &AtomicUsize {
        match self {
            LockSlot::Embedded(word) => word,
            LockSlot::Record(record) => record.alternate_lockword(),
        }
    }
}

/// CAS-only implementation of the runtime helper.
#[derive(Debug)]
pub struct MonitorRuntime {
    table: Arc<MonitorTable>,
    registry: Arc<ThreadRegistry>,
    stats: MonitorStats,
}

impl MonitorRuntime {
    /// Create a helper over a monitor table and thread registry.
    pub fn new(table: Arc<MonitorTable>, registry: Arc<ThreadRegistry>) -> Self {
        Self {
            table,
            registry,
            stats: MonitorStats::new(),
        }
    }

    /// Helper counters.
    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Extra recursion depth of `object` tracked outside its lock word.
    pub fn overflow_depth(&self, object: &ObjectRef) -> usize {
        self.table
            .get(object)
            .map(|record| record.overflow_depth().load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Find the lock word, creating and caching a monitor record for
    /// objects without an embedded one.
    fn resolve<'a>(&self, thread: &ThreadContext, object: &'a ObjectRef) -> LockSlot<'a> {
        if let Some(word) = object.embedded_lock_word() {
            return LockSlot::Embedded(word);
        }
        let record = match thread.lookup_monitor(object) {
            Some(record) => record,
            None => {
                let record = self.table.get_or_create(object);
                thread.cache_monitor(Arc::clone(&record));
                trace!(thread = %thread.identity(), object = format_args!("{:#x}", object.address()), "cached monitor record");
                record
            }
        };
        LockSlot::Record(record)
    }

    /// Cancel a reservation held by another thread.
    fn revoke(&self, word: &AtomicUsize, owner: ThreadIdentity) {
        let lease = self.registry.lease_of(owner);
        let _held = lease.as_ref().map(|lease| lease.lock());

        loop {
            let current = LockWord::from_raw(word.load(Ordering::Acquire));
            if !current.is_reserved() || !current.is_owned_by(owner) {
                return;
            }
            let cleared = LockWord::from_raw(current.raw() & !RESERVED);
            let new = if cleared.is_held() { cleared } else { LockWord::UNLOCKED };
            if word
                .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.stats.revocations.inc();
                debug!(owner = %owner, attached = lease.is_some(), from = ?current, to = ?new, "cancelled reservation");
                return;
            }
        }
    }

    fn illegal(&self, thread: &ThreadContext, object: &ObjectRef) -> MonitorError {
        self.stats.errors.inc();
        MonitorError::IllegalMonitorState {
            thread: thread.identity(),
            object: object.address(),
        }
    }
}

fn cas(word: &AtomicUsize, current: LockWord, new: usize) -> bool {
    word.compare_exchange(current.raw(), new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

impl RuntimeHelper for MonitorRuntime {
    fn monitor_enter(&self, thread: &ThreadContext, object: &ObjectRef) -> MonitorResult<()> {
        self.stats.helper_enters.inc();

        let class = object.class();
        if class.forbids_locking() {
            self.stats.errors.inc();
            return Err(MonitorError::LockingDisallowed { class: class.id() });
        }

        let slot = self.resolve(thread, object);
        let word = slot.word();
        let me = thread.identity();
        let backoff = Backoff::new();

        loop {
            let current = LockWord::from_raw(word.load(Ordering::Acquire));

            if current.is_unlocked() {
                if cas(word, current, me.as_usize() | INC) {
                    return Ok(());
                }
                continue;
            }

            if current.is_owned_by(me) {
                if current.has_flc() {
                    let record = self.table.get_or_create(object);
                    record.overflow_depth().fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                if current.recursion() < MAX_RECURSION {
                    if cas(word, current, current.raw() + INC) {
                        return Ok(());
                    }
                    continue;
                }
                let record = self.table.get_or_create(object);
                record.overflow_depth().store(1, Ordering::Relaxed);
                if cas(word, current, current.raw() | FLC) {
                    self.stats.overflows.inc();
                    debug!(thread = %me, object = format_args!("{:#x}", object.address()), "recursion overflow");
                    return Ok(());
                }
                record.overflow_depth().store(0, Ordering::Relaxed);
                continue;
            }

            match current.owner() {
                Some(owner) if current.is_reserved() => {
                    self.revoke(word, owner);
                    backoff.reset();
                }
                _ => {
                    self.stats.contended_spins.inc();
                    backoff.snooze();
                }
            }
        }
    }

    fn monitor_exit(&self, thread: &ThreadContext, object: &ObjectRef) -> MonitorResult<()> {
        self.stats.helper_exits.inc();

        let slot = self.resolve(thread, object);
        let word = slot.word();
        let me = thread.identity();

        loop {
            let current = LockWord::from_raw(word.load(Ordering::Acquire));
            if !current.is_owned_by(me) || !current.is_held() {
                return Err(self.illegal(thread, object));
            }

            if current.has_flc() {
                let record = self.table.get_or_create(object);
                let depth = record.overflow_depth().load(Ordering::Relaxed);
                if depth > 1 {
                    record.overflow_depth().store(depth - 1, Ordering::Relaxed);
                    return Ok(());
                }
                if cas(word, current, current.raw() & !FLC) {
                    record.overflow_depth().store(0, Ordering::Relaxed);
                    debug!(thread = %me, object = format_args!("{:#x}", object.address()), "recursion overflow unwound");
                    return Ok(());
                }
                continue;
            }

            let new = if current.recursion() > 1 {
                current.raw() - INC
            } else if current.is_reserved() {
                me.as_usize() | RESERVED
            } else {
                0
            };
            if cas(word, current, new) {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassFlags, ClassMetadata};

    fn runtime() -> (MonitorRuntime, Arc<ThreadRegistry>) {
        let registry = Arc::new(ThreadRegistry::new());
        let runtime = MonitorRuntime::new(Arc::new(MonitorTable::new()), Arc::clone(&registry));
        (runtime, registry)
    }

    fn object() -> ObjectRef {
        ObjectRef::allocate(&ClassMetadata::builder("Obj").build())
    }

    fn raw(obj: &ObjectRef) -> usize {
        obj.lock_word().unwrap().raw()
    }

    #[test]
    fn test_enter_exit_free_word() {
        let (rt, registry) = runtime();
        let thread = ThreadContext::attach(&registry, 32);
        let obj = object();
        rt.monitor_enter(&thread, &obj).unwrap();
        assert_eq!(raw(&obj), thread.identity().as_usize() | INC);
        rt.monitor_exit(&thread, &obj).unwrap();
        assert_eq!(raw(&obj), 0);
    }

    #[test]
    fn test_exit_without_enter() {
        let (rt, registry) = runtime();
        let thread = ThreadContext::attach(&registry, 32);
        let obj = object();
        let err = rt.monitor_exit(&thread, &obj).unwrap_err();
        assert!(matches!(err, MonitorError::IllegalMonitorState { .. }));
        assert_eq!(rt.stats().errors.get(), 1);
    }

    #[test]
    fn test_exit_of_unlocked_reservation_is_illegal() {
        let (rt, registry) = runtime();
        let thread = ThreadContext::attach(&registry, 32);
        let obj = object();
        obj.embedded_lock_word()
            .unwrap()
            .store(LockWord::reserved_for(thread.identity()).raw(), Ordering::Relaxed);
        assert!(rt.monitor_exit(&thread, &obj).is_err());
    }

    #[test]
    fn test_locking_disallowed() {
        let (rt, registry) = runtime();
        let thread = ThreadContext::attach(&registry, 32);
        let class = ClassMetadata::builder("Integer")
            .flags(ClassFlags::RESOLVED | ClassFlags::VALUE_BASED)
            .build();
        let obj = ObjectRef::allocate(&class);
        assert_eq!(
            rt.monitor_enter(&thread, &obj),
            Err(MonitorError::LockingDisallowed { class: class.id() })
        );
        assert_eq!(raw(&obj), 0);
    }

    #[test]
    fn test_overflow_and_unwind() {
        let (rt, registry) = runtime();
        let thread = ThreadContext::attach(&registry, 32);
        let obj = object();
        let holds = MAX_RECURSION + 3;

        for _ in 0..holds {
            rt.monitor_enter(&thread, &obj).unwrap();
        }
        let word = obj.lock_word().unwrap();
        assert!(word.has_flc());
        assert_eq!(word.recursion(), MAX_RECURSION);
        assert_eq!(rt.overflow_depth(&obj), 3);
        assert_eq!(rt.stats().overflows.get(), 1);

        for _ in 0..holds {
            rt.monitor_exit(&thread, &obj).unwrap();
        }
        assert_eq!(raw(&obj), 0);
        assert_eq!(rt.overflow_depth(&obj), 0);
        assert!(rt.monitor_exit(&thread, &obj).is_err());
    }

    #[test]
    fn test_revoke_detached_owner() {
        let (rt, registry) = runtime();
        let obj = object();
        let gone = ThreadContext::attach(&registry, 32).identity();
        obj.embedded_lock_word()
            .unwrap()
            .store(LockWord::reserved_for(gone).raw(), Ordering::Relaxed);

        let thread = ThreadContext::attach(&registry, 32);
        rt.monitor_enter(&thread, &obj).unwrap();
        assert_eq!(raw(&obj), thread.identity().as_usize() | INC);
        assert_eq!(rt.stats().revocations.get(), 1);
    }

    #[test]
    fn test_revoke_keeps_recursion() {
        let (rt, registry) = runtime();
        let owner = ThreadContext::attach(&registry, 32);
        let obj = object();
        let held = LockWord::compose(Some(owner.identity()), true, false, 2);
        let lock_word = obj.embedded_lock_word().unwrap();
        lock_word.store(held.raw(), Ordering::Relaxed);

        rt.revoke(lock_word, owner.identity());
        assert_eq!(raw(&obj), LockWord::held_by(owner.identity(), 2).raw());
    }

    #[test]
    fn test_reserved_last_exit_keeps_reservation() {
        let (rt, registry) = runtime();
        let thread = ThreadContext::attach(&registry, 32);
        let obj = object();
        let held = LockWord::compose(Some(thread.identity()), true, false, 1);
        obj.embedded_lock_word().unwrap().store(held.raw(), Ordering::Relaxed);
        rt.monitor_exit(&thread, &obj).unwrap();
        assert_eq!(raw(&obj), LockWord::reserved_for(thread.identity()).raw());
    }

    #[test]
    fn test_cache_populated_for_bare_objects() {
        let (rt, registry) = runtime();
        let thread = ThreadContext::attach(&registry, 32);
        let class = ClassMetadata::builder("Bare").embedded_lock_word(false).build();
        let obj = ObjectRef::allocate(&class);

        assert!(thread.lookup_monitor(&obj).is_none());
        rt.monitor_enter(&thread, &obj).unwrap();
        let record = thread.lookup_monitor(&obj).unwrap();
        assert_eq!(record.lock_word().raw(), thread.identity().as_usize() | INC);
        rt.monitor_exit(&thread, &obj).unwrap();
        assert_eq!(record.lock_word(), LockWord::UNLOCKED);
    }
}
