//! Error types.
//!
//! Only [`MonitorError`] is ever visible to code that locks objects. The
//! others surface while configuring the runtime or compiling a lock site.

use thiserror::Error;

use crate::class::ClassId;
use crate::lockword::ThreadIdentity;

/// Errors raised by the runtime helper on behalf of a monitor operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// Exit without a matching enter by the same thread.
    #[error("illegal monitor state: {thread} does not own the monitor of object {object:#x}")]
    IllegalMonitorState {
        /// The exiting thread.
        thread: ThreadIdentity,
        /// Address of the object.
        object: usize,
    },
    /// Enter on an instance of a value-based class or value type.
    #[error("locking is disallowed on instances of class {class}")]
    LockingDisallowed {
        /// The offending class.
        class: ClassId,
    },
    /// A monitor operation inside a primitive locked region.
    #[error("{thread} attempted a monitor operation inside a primitive locked region")]
    InsidePrimitiveRegion {
        /// The thread owning the region.
        thread: ThreadIdentity,
    },
}

/// Failure to locate the lock word of a class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    /// The class metadata has not been resolved yet.
    #[error("class {class} is unresolved")]
    Unresolved {
        /// The class.
        class: ClassId,
    },
    /// The embedded offset is not word aligned or lies outside the object.
    #[error("class {class} has an unusable lock word offset {offset}")]
    Misaligned {
        /// The class.
        class: ClassId,
        /// The byte offset.
        offset: usize,
    },
}

/// Errors produced while building an operation sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoweringError {
    /// A branch targets a label that was never bound.
    #[error("label L{0} is referenced but never bound")]
    UnboundLabel(usize),
    /// A label was bound twice.
    #[error("label L{0} is bound more than once")]
    DuplicateBinding(usize),
}

/// Faults while executing an operation sequence.
///
/// These indicate a sequence that does not fit the object it runs against.
/// Callers recover by handing the operation to the runtime helper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// A memory operation ran before the lock word was located.
    #[error("op {pc} touches the lock word before it is located")]
    NoSlot {
        /// Faulting position.
        pc: usize,
    },
    /// The object has no word at the embedded offset.
    #[error("object has no word at byte offset {offset}")]
    BadOffset {
        /// The offset.
        offset: usize,
    },
    /// Control ran off the end of the sequence.
    #[error("control fell off the end of the sequence at {pc}")]
    FellOff {
        /// Position reached.
        pc: usize,
    },
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Result alias for monitor operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_monitor_state_display() {
        let thread = ThreadIdentity::from_raw(0x300).unwrap();
        let err = MonitorError::IllegalMonitorState { thread, object: 0x1000 };
        let msg = err.to_string();
        assert!(msg.contains("0x300"));
        assert!(msg.contains("0x1000"));
    }

    #[test]
    fn test_primitive_region_display() {
        let thread = ThreadIdentity::from_raw(0x500).unwrap();
        let msg = MonitorError::InsidePrimitiveRegion { thread }.to_string();
        assert!(msg.contains("0x500"));
        assert!(msg.contains("primitive"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "cache.size".into(),
            message: "must be a power of two".into(),
        };
        assert!(err.to_string().contains("cache.size"));
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_lowering_error_display() {
        assert_eq!(
            LoweringError::UnboundLabel(3).to_string(),
            "label L3 is referenced but never bound"
        );
    }
}
