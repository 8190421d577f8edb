//! # Lock Word Encoding
//!
//! A monitor's state lives in a single machine word, stored either in the
//! object header or in the `alternate_lockword` of a [`MonitorRecord`].
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┬───────────┬───┬───┬───┬───┐
//! │ 63                                         8 │ 7       4 │ 3 │ 2 │ 1 │ 0 │
//! ├──────────────────────────────────────────────┼───────────┼───┼───┼───┼───┤
//! │                OWNER (thread identity)       │ RECURSION │ - │RES│FLC│ - │
//! └──────────────────────────────────────────────┴───────────┴───┴───┴───┴───┘
//! ```
//!
//! - `OWNER`: zero, or the identity of the holding / reserving thread.
//!   Thread identities are allocated with the low eight bits clear so an
//!   identity can be or-ed straight into a word.
//! - `RES`: the lock is reserved (biased) toward `OWNER`, even while unlocked.
//! - `FLC`: recursion overflowed; the true depth is tracked by the runtime.
//! - `RECURSION`: nested hold count of the owner.
//!
//! Bits 0 and 3 are left to the runtime and are never produced by the fast
//! paths. A word of `0` is fully unlocked and unreserved.
//!
//! [`MonitorRecord`]: crate::monitor_cache::MonitorRecord

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Raw bit assignments of the lock word.
pub mod bits {
    /// Recursion overflow: depth beyond the field is tracked externally.
    pub const FLC: usize = 0x02;
    /// Lock is reserved toward its owner.
    pub const RESERVED: usize = 0x04;
    /// Lowest bit of the recursion field (one unit of recursion).
    pub const FIRST_RECURSION_BIT: usize = 0x10;
    /// Highest bit of the recursion field.
    pub const LAST_RECURSION_BIT: usize = 0x80;
    /// The recursion field.
    pub const RECURSION_MASK: usize = 0xF0;
    /// Shift of the recursion field.
    pub const RECURSION_SHIFT: u32 = 4;
    /// All non-owner bits.
    pub const LOCK_BITS_MASK: usize = 0xFF;
    /// The owner field.
    pub const OWNER_MASK: usize = !LOCK_BITS_MASK;
    /// One unit of recursion.
    pub const INC: usize = FIRST_RECURSION_BIT;
    /// Largest recursion count the field can hold.
    pub const MAX_RECURSION: usize = RECURSION_MASK >> RECURSION_SHIFT;
}

/// Composite masks used by the fast-path protocols.
///
/// Each mask names the bits that are cleared (`andc`) before a word is
/// compared against `self | RESERVED` or `self`.
pub mod masks {
    use super::bits::*;

    /// Non-primitive reserved re-entry: the lower recursion bits may vary.
    ///
    /// The top recursion bit is *not* masked, so a count of 8 or more fails
    /// the compare and the increment is left to the runtime.
    pub const RES_NON_PRIMITIVE_ENTER: usize = RECURSION_MASK & !LAST_RECURSION_BIT;
    /// Primitive reserved entry: any recursion count held by self is fine.
    pub const RES_PRIMITIVE_ENTER: usize = RECURSION_MASK;
    /// Bits allowed to vary on a reserved exit.
    pub const RES_OWNING_COMPLEMENT: usize = RECURSION_MASK;
    /// Recursion bits that mean "more than one hold" on a reserved exit.
    pub const RES_NON_PRIMITIVE_EXIT: usize = RECURSION_MASK & !FIRST_RECURSION_BIT;
    /// Bits allowed to vary when the counting lock checks for self-ownership.
    ///
    /// `RESERVED` is included so that the counting protocol preserves a
    /// reservation held by the current thread.
    pub const COUNTING_OWNING_COMPLEMENT: usize = RECURSION_MASK | RESERVED;
}

use bits::*;

// ============================================================================
// Thread Identity
// ============================================================================

/// Opaque, word-sized, non-zero identity of a live thread.
///
/// The low eight bits are always clear, so an identity never collides with
/// any lock-word bit other than the owner field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdentity(NonZeroUsize);

/// Global identity counter. Identities are never reused.
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

impl ThreadIdentity {
    /// Create an identity from a raw word.
    ///
    /// Returns `None` for zero or for values that touch the lock bits.
    pub fn from_raw(raw: usize) -> Option<Self> {
        if raw & LOCK_BITS_MASK != 0 {
            return None;
        }
        NonZeroUsize::new(raw).map(Self)
    }

    /// Allocate a fresh identity.
    pub(crate) fn next() -> Self {
        loop {
            let n = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = Self::from_raw(n << 8) {
                return id;
            }
        }
    }

    /// The raw word value.
    pub fn as_usize(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadIdentity({:#x})", self.0)
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {:#x}", self.0)
    }
}

// ============================================================================
// Lock Word
// ============================================================================

/// A decoded view of a lock word value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockWord(usize);

impl LockWord {
    /// Fully unlocked, never reserved.
    pub const UNLOCKED: LockWord = LockWord(0);

    /// Wrap a raw word.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Compose a word from its fields.
    ///
    /// The recursion count is truncated to the field width.
    pub fn compose(owner: Option<ThreadIdentity>, reserved: bool, flc: bool, recursion: usize) -> Self {
        debug_assert!(recursion <= MAX_RECURSION, "recursion {} exceeds field", recursion);
        let mut raw = owner.map(ThreadIdentity::as_usize).unwrap_or(0);
        if reserved {
            raw |= RESERVED;
        }
        if flc {
            raw |= FLC;
        }
        raw |= (recursion << RECURSION_SHIFT) & RECURSION_MASK;
        Self(raw)
    }

    /// `owner | RESERVED`: reserved toward `owner` and currently unlocked.
    pub fn reserved_for(owner: ThreadIdentity) -> Self {
        Self(owner.as_usize() | RESERVED)
    }

    /// Held by `owner` with the given recursion count, not reserved.
    pub fn held_by(owner: ThreadIdentity, recursion: usize) -> Self {
        Self::compose(Some(owner), false, false, recursion)
    }

    /// The raw word.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// The owner field, if non-zero.
    pub fn owner(self) -> Option<ThreadIdentity> {
        ThreadIdentity::from_raw(self.0 & OWNER_MASK)
    }

    /// Whether the owner field names `thread`.
    pub fn is_owned_by(self, thread: ThreadIdentity) -> bool {
        self.0 & OWNER_MASK == thread.as_usize()
    }

    /// Whether the reservation bit is set.
    pub fn is_reserved(self) -> bool {
        self.0 & RESERVED != 0
    }

    /// Whether the recursion-overflow bit is set.
    pub fn has_flc(self) -> bool {
        self.0 & FLC != 0
    }

    /// The recursion count stored in the word.
    pub fn recursion(self) -> usize {
        (self.0 & RECURSION_MASK) >> RECURSION_SHIFT
    }

    /// Whether the word is `0`.
    pub fn is_unlocked(self) -> bool {
        self.0 == 0
    }

    /// Whether the word records at least one hold (or an overflow).
    pub fn is_held(self) -> bool {
        self.owner().is_some() && (self.recursion() > 0 || self.has_flc())
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockWord")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("owner", &self.owner())
            .field("reserved", &self.is_reserved())
            .field("flc", &self.has_flc())
            .field("recursion", &self.recursion())
            .finish()
    }
}

impl From<LockWord> for usize {
    fn from(word: LockWord) -> usize {
        word.0
    }
}
