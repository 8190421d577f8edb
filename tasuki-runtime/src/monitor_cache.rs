//! # Monitor Records and the Per-Thread Monitor Cache
//!
//! Objects without an embedded lock word keep their lock word in a
//! [`MonitorRecord`] (`alternate_lockword`). Records are created lazily by
//! the runtime helper and registered in the global [`MonitorTable`].
//!
//! Each thread keeps a small direct-mapped [`MonitorCache`] in front of the
//! table. The fast path probes it, and a hit is trusted only after the
//! record's object address is compared against the object being locked.
//! Collisions overwrite; a stale entry is simply a miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::heap::{ObjectRef, WeakObjectRef, ALIGNMENT_SHIFT};
use crate::lockword::LockWord;

/// Table size below which dead records are left in place.
pub const SWEEP_THRESHOLD: usize = 64;

// ============================================================================
// Monitor Record
// ============================================================================

/// Out-of-line monitor state for one object.
///
/// The record refers to its object weakly. It dies with the object and is
/// swept from the [`MonitorTable`] afterwards; until then the weak reference
/// keeps the object's address from being handed to a new object.
#[derive(Debug)]
pub struct MonitorRecord {
    object: WeakObjectRef,
    alternate_lockword: AtomicUsize,
    overflow_depth: AtomicUsize,
}

impl MonitorRecord {
    fn new(object: &ObjectRef) -> Self {
        Self {
            object: object.downgrade(),
            alternate_lockword: AtomicUsize::new(0),
            overflow_depth: AtomicUsize::new(0),
        }
    }

    /// The monitored object, unless it has died.
    pub fn object(&self) -> Option<ObjectRef> {
        self.object.upgrade()
    }

    /// Whether the monitored object is still alive.
    pub fn is_live(&self) -> bool {
        self.object.is_live()
    }

    /// Address of the monitored object; the cache validates against this.
    pub fn object_address(&self) -> usize {
        self.object.address()
    }

    /// The out-of-line lock word.
    pub fn alternate_lockword(&self) -> &AtomicUsize {
        &self.alternate_lockword
    }

    /// Snapshot of the out-of-line lock word.
    pub fn lock_word(&self) -> LockWord {
        LockWord::from_raw(self.alternate_lockword.load(Ordering::Acquire))
    }

    /// Recursion depth held beyond what the lock word can count.
    ///
    /// Only the owning thread touches this, while FLC is set in the word.
    pub(crate) fn overflow_depth(&self) -> &AtomicUsize {
        &self.overflow_depth
    }
}

// ============================================================================
// Monitor Table
// ============================================================================

#[derive(Debug)]
struct Records {
    by_address: HashMap<usize, Arc<MonitorRecord>>,
    sweep_at: usize,
}

impl Records {
    fn sweep(&mut self) -> usize {
        let before = self.by_address.len();
        self.by_address.retain(|_, record| record.is_live());
        self.sweep_at = SWEEP_THRESHOLD.max(2 * self.by_address.len());
        before - self.by_address.len()
    }
}

/// Global registry of monitor records, keyed by object address.
///
/// Records of dead objects are swept whenever the table doubles past its
/// live size, and on [`MonitorTable::purge`]. A dead object cannot be
/// locked again, so dropping its record is never observable.
#[derive(Debug)]
pub struct MonitorTable {
    records: RwLock<Records>,
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self {
            records: RwLock::new(Records {
                by_address: HashMap::new(),
                sweep_at: SWEEP_THRESHOLD,
            }),
        }
    }
}

impl MonitorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record of `object`, if one exists.
    pub fn get(&self, object: &ObjectRef) -> Option<Arc<MonitorRecord>> {
        self.records.read().by_address.get(&object.address()).cloned()
    }

    /// The record of `object`, created on first use.
    pub fn get_or_create(&self, object: &ObjectRef) -> Arc<MonitorRecord> {
        if let Some(record) = self.get(object) {
            return record;
        }
        let mut records = self.records.write();
        if records.by_address.len() >= records.sweep_at {
            let swept = records.sweep();
            trace!(swept, live = records.by_address.len(), "swept monitor records");
        }
        Arc::clone(records.by_address.entry(object.address()).or_insert_with(|| {
            trace!(object = format_args!("{:#x}", object.address()), "created monitor record");
            Arc::new(MonitorRecord::new(object))
        }))
    }

    /// Drop the records of every dead object. Returns how many went.
    pub fn purge(&self) -> usize {
        let swept = self.records.write().sweep();
        if swept > 0 {
            debug!(swept, "purged monitor records");
        }
        swept
    }

    /// Number of records, dead ones not yet swept included.
    pub fn len(&self) -> usize {
        self.records.read().by_address.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Monitor Cache
// ============================================================================

/// Per-thread direct-mapped cache from object address to monitor record.
#[derive(Debug)]
pub struct MonitorCache {
    entries: Box<[Option<Arc<MonitorRecord>>]>,
    mask: usize,
}

impl MonitorCache {
    /// Create a cache with `size` entries. `size` must be a power of two.
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            entries: (0..size).map(|_| None).collect(),
            mask: size - 1,
        }
    }

    /// Number of entries.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Index mask (`capacity - 1`).
    pub fn mask(&self) -> usize {
        self.mask
    }

    /// Slot for an object address.
    pub fn index_for(&self, address: usize) -> usize {
        cache_index(address, self.mask)
    }

    /// Probe one slot, validating it against `address`.
    pub fn probe(&self, index: usize, address: usize) -> Option<&Arc<MonitorRecord>> {
        self.entries
            .get(index)
            .and_then(Option::as_ref)
            .filter(|record| record.object_address() == address)
    }

    /// Look up the record of `object`.
    pub fn lookup(&self, object: &ObjectRef) -> Option<Arc<MonitorRecord>> {
        let address = object.address();
        self.probe(self.index_for(address), address).cloned()
    }

    /// Install a record, evicting whatever shares its slot.
    pub fn insert(&mut self, record: Arc<MonitorRecord>) {
        let index = self.index_for(record.object_address());
        self.entries[index] = Some(record);
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }
}

/// Address-derived cache index: drop the alignment bits, then mask.
pub fn cache_index(address: usize, mask: usize) -> usize {
    (address >> ALIGNMENT_SHIFT) & mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassMetadata;

    fn bare_object() -> ObjectRef {
        let class = ClassMetadata::builder("Bare").embedded_lock_word(false).build();
        ObjectRef::allocate(&class)
    }

    #[test]
    fn test_cache_index() {
        assert_eq!(cache_index(0x1000, 31), (0x1000 >> 3) & 31);
        assert_eq!(cache_index(0x1008, 31), ((0x1000 >> 3) + 1) & 31);
        assert_eq!(cache_index(0xFFFF_FFF8, 0), 0);
    }

    #[test]
    fn test_table_get_or_create_is_stable() {
        let table = MonitorTable::new();
        let obj = bare_object();
        assert!(table.get(&obj).is_none());
        let a = table.get_or_create(&obj);
        let b = table.get_or_create(&obj);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert_eq!(a.lock_word(), LockWord::UNLOCKED);
    }

    #[test]
    fn test_dead_records_are_swept() {
        let table = MonitorTable::new();
        for _ in 0..1000 {
            let obj = bare_object();
            table.get_or_create(&obj);
        }
        assert!(table.len() <= SWEEP_THRESHOLD, "table grew to {}", table.len());
        table.purge();
        assert!(table.is_empty());
    }

    #[test]
    fn test_purge_keeps_live_records() {
        let table = MonitorTable::new();
        let live = bare_object();
        let record = table.get_or_create(&live);
        table.get_or_create(&bare_object());
        assert_eq!(table.len(), 2);

        assert_eq!(table.purge(), 1);
        assert!(Arc::ptr_eq(&table.get(&live).unwrap(), &record));
        assert_eq!(record.object(), Some(live.clone()));

        drop(live);
        assert!(!record.is_live());
        assert!(record.object().is_none());
        assert_eq!(table.purge(), 1);
    }

    #[test]
    fn test_cache_miss_then_hit() {
        let table = MonitorTable::new();
        let mut cache = MonitorCache::new(32);
        let obj = bare_object();
        assert!(cache.lookup(&obj).is_none());
        cache.insert(table.get_or_create(&obj));
        let hit = cache.lookup(&obj).unwrap();
        assert_eq!(hit.object_address(), obj.address());
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn test_collision_is_a_miss_never_a_wrong_hit() {
        let table = MonitorTable::new();
        // One slot: every object collides.
        let mut cache = MonitorCache::new(1);
        let a = bare_object();
        let b = bare_object();
        cache.insert(table.get_or_create(&a));
        assert!(cache.lookup(&b).is_none());
        cache.insert(table.get_or_create(&b));
        assert!(cache.lookup(&a).is_none());
        assert_eq!(cache.lookup(&b).unwrap().object_address(), b.address());
    }

    #[test]
    fn test_clear() {
        let table = MonitorTable::new();
        let mut cache = MonitorCache::new(4);
        let obj = bare_object();
        cache.insert(table.get_or_create(&obj));
        cache.clear();
        assert_eq!(cache.occupied(), 0);
        assert!(cache.lookup(&obj).is_none());
    }
}
