//! Monitor Statistics
//!
//! Two kinds of numbers are kept:
//!
//! - [`ExecStats`]: per-thread counts of every operation the fast-path
//!   interpreter executed, split by kind. These are what the
//!   "zero atomic operations on a reserved re-entry" guarantee is checked
//!   against.
//! - [`MonitorStats`]: process-wide counters maintained by the runtime
//!   helper (helper entries, reservation revocations, recursion overflow).

use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Execution Counts
// ============================================================================

/// Counts of executed operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    /// Acquire loads of a lock word.
    pub atomic_loads: u64,
    /// Compare-and-swap attempts.
    pub cas_attempts: u64,
    /// Compare-and-swap attempts that failed.
    pub cas_failures: u64,
    /// Plain loads of a lock word.
    pub plain_loads: u64,
    /// Plain stores to a lock word.
    pub plain_stores: u64,
    /// Release fences.
    pub fences: u64,
    /// Hand-offs to the runtime helper.
    pub helper_calls: u64,
    /// Monitor cache probes that missed.
    pub cache_misses: u64,
}

impl ExecStats {
    /// Atomic lock-word operations: acquire loads plus CAS attempts.
    pub fn atomic_ops(&self) -> u64 {
        self.atomic_loads + self.cas_attempts
    }
}

impl Add for ExecStats {
    type Output = ExecStats;

    fn add(mut self, rhs: ExecStats) -> ExecStats {
        self += rhs;
        self
    }
}

impl AddAssign for ExecStats {
    fn add_assign(&mut self, rhs: ExecStats) {
        self.atomic_loads += rhs.atomic_loads;
        self.cas_attempts += rhs.cas_attempts;
        self.cas_failures += rhs.cas_failures;
        self.plain_loads += rhs.plain_loads;
        self.plain_stores += rhs.plain_stores;
        self.fences += rhs.fences;
        self.helper_calls += rhs.helper_calls;
        self.cache_misses += rhs.cache_misses;
    }
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "atomic={} (ld={} cas={} failed={}) plain ld={} st={} fences={} helper={} cache-miss={}",
            self.atomic_ops(),
            self.atomic_loads,
            self.cas_attempts,
            self.cas_failures,
            self.plain_loads,
            self.plain_stores,
            self.fences,
            self.helper_calls,
            self.cache_misses,
        )
    }
}

// ============================================================================
// Process-Wide Counters
// ============================================================================

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    description: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Get the current counter value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Add a value to the counter.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
}

/// Counters maintained by the runtime helper.
#[derive(Debug)]
pub struct MonitorStats {
    /// Helper `monitorEnter` calls.
    pub helper_enters: Counter,
    /// Helper `monitorExit` calls.
    pub helper_exits: Counter,
    /// Reservations cancelled on behalf of another thread.
    pub revocations: Counter,
    /// Recursion overflows into external depth tracking.
    pub overflows: Counter,
    /// Backoff rounds spent waiting for a held monitor.
    pub contended_spins: Counter,
    /// Errors reported to callers.
    pub errors: Counter,
}

impl Default for MonitorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            helper_enters: Counter::new("helper_enters", "monitorEnter helper calls"),
            helper_exits: Counter::new("helper_exits", "monitorExit helper calls"),
            revocations: Counter::new("revocations", "reservations cancelled"),
            overflows: Counter::new("overflows", "recursion overflows"),
            contended_spins: Counter::new("contended_spins", "backoff rounds on held monitors"),
            errors: Counter::new("errors", "monitor errors raised"),
        }
    }

    /// All counters.
    pub fn counters(&self) -> [&Counter; 6] {
        [
            &self.helper_enters,
            &self.helper_exits,
            &self.revocations,
            &self.overflows,
            &self.contended_spins,
            &self.errors,
        ]
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            helper_enters: self.helper_enters.get(),
            helper_exits: self.helper_exits.get(),
            revocations: self.revocations.get(),
            overflows: self.overflows.get(),
            contended_spins: self.contended_spins.get(),
            errors: self.errors.get(),
        }
    }
}

/// Copy of [`MonitorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStatsSnapshot {
    /// Helper `monitorEnter` calls.
    pub helper_enters: u64,
    /// Helper `monitorExit` calls.
    pub helper_exits: u64,
    /// Reservations cancelled.
    pub revocations: u64,
    /// Recursion overflows.
    pub overflows: u64,
    /// Backoff rounds.
    pub contended_spins: u64,
    /// Errors raised.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_stats_add() {
        let a = ExecStats {
            atomic_loads: 1,
            cas_attempts: 2,
            cas_failures: 1,
            ..ExecStats::default()
        };
        let b = ExecStats {
            plain_loads: 3,
            plain_stores: 1,
            cas_attempts: 1,
            ..ExecStats::default()
        };
        let sum = a + b;
        assert_eq!(sum.cas_attempts, 3);
        assert_eq!(sum.plain_loads, 3);
        assert_eq!(sum.atomic_ops(), 4);
    }

    #[test]
    fn test_counter() {
        let counter = Counter::new("c", "a counter");
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "c");
    }

    #[test]
    fn test_snapshot() {
        let stats = MonitorStats::new();
        stats.revocations.inc();
        stats.helper_enters.add(2);
        let snap = stats.snapshot();
        assert_eq!(snap.revocations, 1);
        assert_eq!(snap.helper_enters, 2);
        assert_eq!(snap.overflows, 0);
        assert_eq!(stats.counters().len(), 6);
    }

    #[test]
    fn test_display() {
        let stats = ExecStats {
            plain_loads: 1,
            plain_stores: 1,
            ..ExecStats::default()
        };
        assert!(stats.to_string().starts_with("atomic=0"));
    }
}
