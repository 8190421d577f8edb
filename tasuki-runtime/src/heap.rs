//! # Object Model
//!
//! Objects are zero-initialized arrays of machine words:
//!
//! ```text
//! word 0            word 1 (optional)      word 2..
//! ┌──────────────┬──────────────────────┬──────────────┐
//! │  class id    │  lock word           │  fields      │
//! └──────────────┴──────────────────────┴──────────────┘
//! ```
//!
//! An object's address is its allocation address. It is word aligned and
//! stays reserved for as long as any [`ObjectRef`] or [`WeakObjectRef`] to
//! it exists, so no other object can take it over in the meantime.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::class::ClassMetadata;
use crate::lockword::LockWord;

/// Bytes per heap word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// log2 of the object alignment.
pub const ALIGNMENT_SHIFT: u32 = WORD_SIZE.trailing_zeros();

/// Words of header preceding the (optional) lock word.
pub const HEADER_WORDS: usize = 1;

struct ObjectData {
    class: Arc<ClassMetadata>,
    words: Box<[AtomicUsize]>,
}

/// A strong reference to a heap object.
#[derive(Clone)]
pub struct ObjectRef(Arc<ObjectData>);

impl ObjectRef {
    /// Allocate a zeroed instance of `class`.
    pub fn allocate(class: &Arc<ClassMetadata>) -> Self {
        let words: Box<[AtomicUsize]> = (0..class.instance_words()).map(|_| AtomicUsize::new(0)).collect();
        words[0].store(class.id().as_u32() as usize, Ordering::Relaxed);
        ObjectRef(Arc::new(ObjectData {
            class: Arc::clone(class),
            words,
        }))
    }

    /// The object's address.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// A weak reference that does not keep the object's contents alive.
    pub fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Arc::downgrade(&self.0))
    }

    /// The object's class.
    pub fn class(&self) -> &Arc<ClassMetadata> {
        &self.0.class
    }

    /// The word at `offset` bytes from the object start.
    pub fn word_at_offset(&self, offset: usize) -> Option<&AtomicUsize> {
        if offset % WORD_SIZE != 0 {
            return None;
        }
        self.0.words.get(offset / WORD_SIZE)
    }

    /// The embedded lock word, if the class has one.
    pub fn embedded_lock_word(&self) -> Option<&AtomicUsize> {
        self.class().lock_word_offset().and_then(|offset| self.word_at_offset(offset))
    }

    /// Snapshot of the embedded lock word.
    pub fn lock_word(&self) -> Option<LockWord> {
        self.embedded_lock_word().map(|w| LockWord::from_raw(w.load(Ordering::Acquire)))
    }

    /// Instance field `index` (zero based, after header and lock word).
    pub fn field(&self, index: usize) -> Option<&AtomicUsize> {
        let first = HEADER_WORDS + usize::from(self.class().lock_word_offset().is_some());
        self.0.words.get(first + index)
    }

    /// Whether two references name the same object.
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("class", &self.class().name())
            .finish()
    }
}

/// A weak reference to a heap object.
#[derive(Clone)]
pub struct WeakObjectRef(Weak<ObjectData>);

impl WeakObjectRef {
    /// The object, if it is still alive.
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }

    /// Whether the object is still alive.
    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// The object's address, valid even after it died.
    pub fn address(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for WeakObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObjectRef")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed() {
        let class = ClassMetadata::builder("Node").fields(3).build();
        let obj = ObjectRef::allocate(&class);
        assert_eq!(obj.lock_word(), Some(LockWord::UNLOCKED));
        for i in 0..3 {
            assert_eq!(obj.field(i).unwrap().load(Ordering::Relaxed), 0);
        }
        assert!(obj.field(3).is_none());
    }

    #[test]
    fn test_class_word() {
        let class = ClassMetadata::builder("Node").build();
        let obj = ObjectRef::allocate(&class);
        let word0 = obj.word_at_offset(0).unwrap().load(Ordering::Relaxed);
        assert_eq!(word0, class.id().as_u32() as usize);
    }

    #[test]
    fn test_address_is_aligned() {
        let class = ClassMetadata::builder("Node").build();
        let obj = ObjectRef::allocate(&class);
        assert_eq!(obj.address() & (WORD_SIZE - 1), 0);
        assert_eq!(obj.address(), obj.clone().address());
    }

    #[test]
    fn test_no_embedded_lock_word() {
        let class = ClassMetadata::builder("Bare").embedded_lock_word(false).fields(1).build();
        let obj = ObjectRef::allocate(&class);
        assert!(obj.embedded_lock_word().is_none());
        assert!(obj.lock_word().is_none());
        assert!(obj.field(0).is_some());
    }

    #[test]
    fn test_unaligned_offset_rejected() {
        let class = ClassMetadata::builder("Node").build();
        let obj = ObjectRef::allocate(&class);
        assert!(obj.word_at_offset(3).is_none());
    }

    #[test]
    fn test_weak_reference_keeps_address() {
        let class = ClassMetadata::builder("Node").build();
        let obj = ObjectRef::allocate(&class);
        let address = obj.address();
        let weak = obj.downgrade();
        assert_eq!(weak.address(), address);
        assert_eq!(weak.upgrade(), Some(obj.clone()));

        drop(obj);
        assert!(!weak.is_live());
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.address(), address);
    }

    #[test]
    fn test_identity_equality() {
        let class = ClassMetadata::builder("Node").build();
        let a = ObjectRef::allocate(&class);
        let b = ObjectRef::allocate(&class);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
