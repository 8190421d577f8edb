//! # Class Metadata and Lock Word Location
//!
//! Every object carries its class. The class decides two things the fast
//! paths care about:
//!
//! - where the lock word lives: at a fixed byte offset inside the object
//!   header, or out of line in a monitor record found through the cache;
//! - whether instances may be locked at all (value-based classes and value
//!   types may not).
//!
//! [`LockWordLocator`] answers the first question once per class and
//! reuses the answer for every lock site compiled against it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::LocateError;
use crate::heap::{HEADER_WORDS, WORD_SIZE};

// ============================================================================
// Class Identity
// ============================================================================

/// Unique identifier of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

static NEXT_CLASS_ID: AtomicU32 = AtomicU32::new(1);

impl ClassId {
    fn next() -> Self {
        ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id, as stored in word 0 of every instance.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.0)
    }
}

// ============================================================================
// Class Flags
// ============================================================================

bitflags::bitflags! {
    /// Runtime class flags.
    ///
    /// | Bit | Name | Meaning |
    /// |-----|------|---------|
    /// | 0 | RESOLVED | Layout and flags are final |
    /// | 1 | VALUE_BASED | Value-based class; locking instances is an error |
    /// | 2 | VALUE_TYPE | Value type; has no identity to lock |
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u32 {
        /// Layout and flags are final.
        const RESOLVED = 0b001;
        /// Value-based class.
        const VALUE_BASED = 0b010;
        /// Value type.
        const VALUE_TYPE = 0b100;
        /// Any flag that forbids locking instances.
        const DISALLOWS_LOCKING = Self::VALUE_BASED.bits() | Self::VALUE_TYPE.bits();
    }
}

impl Default for ClassFlags {
    fn default() -> Self {
        ClassFlags::RESOLVED
    }
}

/// Compile-time knowledge of whether a class forbids locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisallowsLocking {
    /// Every instance forbids locking.
    Always,
    /// No instance forbids locking.
    Never,
    /// Not statically known; must be tested at run time.
    Unknown,
}

// ============================================================================
// Class Metadata
// ============================================================================

/// Where the lock word of a class's instances lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockWordLocation {
    /// At this byte offset from the start of the object.
    Embedded(usize),
    /// No embedded slot; go through the monitor cache.
    UseCache,
}

/// Metadata of a loaded class.
#[derive(Debug)]
pub struct ClassMetadata {
    id: ClassId,
    name: String,
    flags: AtomicU32,
    lock_offset: Option<usize>,
    instance_words: usize,
}

impl ClassMetadata {
    /// Start describing a class.
    pub fn builder(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder {
            name: name.into(),
            flags: ClassFlags::default(),
            embedded_lock_word: true,
            fields: 0,
            lock_offset_override: None,
        }
    }

    /// The class id.
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current flags.
    pub fn flags(&self) -> ClassFlags {
        ClassFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Whether layout and flags are final.
    pub fn is_resolved(&self) -> bool {
        self.flags().contains(ClassFlags::RESOLVED)
    }

    /// Mark the class resolved.
    pub fn resolve(&self) {
        self.flags.fetch_or(ClassFlags::RESOLVED.bits(), Ordering::AcqRel);
    }

    /// Raw byte offset of the embedded lock word, if the layout has one.
    pub fn lock_word_offset(&self) -> Option<usize> {
        self.lock_offset
    }

    /// Number of words in an instance, header included.
    pub fn instance_words(&self) -> usize {
        self.instance_words
    }

    /// Whether instances may never be locked.
    pub fn forbids_locking(&self) -> bool {
        self.flags().intersects(ClassFlags::DISALLOWS_LOCKING)
    }

    /// What the compiler can know about this class's locking status.
    pub fn disallows_locking(&self) -> DisallowsLocking {
        if !self.is_resolved() {
            DisallowsLocking::Unknown
        } else if self.forbids_locking() {
            DisallowsLocking::Always
        } else {
            DisallowsLocking::Never
        }
    }
}

/// Builder for [`ClassMetadata`].
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    flags: ClassFlags,
    embedded_lock_word: bool,
    fields: usize,
    lock_offset_override: Option<usize>,
}

impl ClassBuilder {
    /// Whether instances get an embedded lock word right after the class word.
    pub fn embedded_lock_word(mut self, embedded: bool) -> Self {
        self.embedded_lock_word = embedded;
        self
    }

    /// Number of instance fields (one word each).
    pub fn fields(mut self, fields: usize) -> Self {
        self.fields = fields;
        self
    }

    /// Replace the flags.
    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Force a specific lock word byte offset.
    pub fn lock_word_at(mut self, offset: usize) -> Self {
        self.embedded_lock_word = true;
        self.lock_offset_override = Some(offset);
        self
    }

    /// Finish the class.
    pub fn build(self) -> Arc<ClassMetadata> {
        let lock_words = usize::from(self.embedded_lock_word);
        let lock_offset = if self.embedded_lock_word {
            Some(self.lock_offset_override.unwrap_or(HEADER_WORDS * WORD_SIZE))
        } else {
            None
        };
        Arc::new(ClassMetadata {
            id: ClassId::next(),
            name: self.name,
            flags: AtomicU32::new(self.flags.bits()),
            lock_offset,
            instance_words: HEADER_WORDS + lock_words + self.fields,
        })
    }
}

// ============================================================================
// Lock Word Locator
// ============================================================================

/// Resolves and memoizes [`LockWordLocation`] per class.
#[derive(Debug, Default)]
pub struct LockWordLocator {
    resolved: RwLock<HashMap<ClassId, LockWordLocation>>,
}

impl LockWordLocator {
    /// Create an empty locator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the lock word of `class` lives.
    ///
    /// Fails only for unresolved classes or unusable offsets; callers treat
    /// any failure as "call the runtime helper".
    pub fn locate(&self, class: &ClassMetadata) -> Result<LockWordLocation, LocateError> {
        if let Some(location) = self.resolved.read().get(&class.id()) {
            return Ok(*location);
        }

        if !class.is_resolved() {
            return Err(LocateError::Unresolved { class: class.id() });
        }

        let location = match class.lock_word_offset() {
            None => LockWordLocation::UseCache,
            Some(offset) => {
                let in_bounds = offset < class.instance_words() * WORD_SIZE;
                if offset % WORD_SIZE != 0 || offset < WORD_SIZE || !in_bounds {
                    return Err(LocateError::Misaligned {
                        class: class.id(),
                        offset,
                    });
                }
                LockWordLocation::Embedded(offset)
            }
        };

        trace!(class = %class.id(), name = class.name(), ?location, "resolved lock word location");
        self.resolved.write().insert(class.id(), location);
        Ok(location)
    }

    /// Number of memoized classes.
    pub fn len(&self) -> usize {
        self.resolved.read().len()
    }

    /// Whether nothing has been memoized yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
