//! # Slow Path Bridge
//!
//! The narrow contract between the fast paths and the runtime helper.
//! Whatever a fast path cannot resolve is handed over unmodified: the helper
//! performs the whole enter or exit, may block, may populate the calling
//! thread's monitor cache, and owns all error reporting.
//!
//! The caller must not hold its access lease across the call, and must not
//! resume any partially executed sequence afterwards.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::MonitorResult;
use crate::heap::ObjectRef;
use crate::ops::HelperKind;
use crate::thread::ThreadContext;

/// Runtime entry points behind the slow path.
pub trait RuntimeHelper: Send + Sync {
    /// Acquire the monitor of `object` for `thread`, blocking if needed.
    fn monitor_enter(&self, thread: &ThreadContext, object: &ObjectRef) -> MonitorResult<()>;

    /// Release one hold of the monitor of `object` by `thread`.
    fn monitor_exit(&self, thread: &ThreadContext, object: &ObjectRef) -> MonitorResult<()>;
}

/// Dispatches fast-path hand-offs to a [`RuntimeHelper`].
#[derive(Clone)]
pub struct SlowPathBridge {
    helper: Arc<dyn RuntimeHelper>,
}

impl SlowPathBridge {
    /// Wrap a helper.
    pub fn new(helper: Arc<dyn RuntimeHelper>) -> Self {
        Self { helper }
    }

    /// Perform `kind` on `object` through the helper.
    pub fn call_helper(&self, thread: &ThreadContext, object: &ObjectRef, kind: HelperKind) -> MonitorResult<()> {
        debug_assert!(!thread.holds_lease(), "helper called with the access lease held");
        trace!(thread = %thread.identity(), object = format_args!("{:#x}", object.address()), %kind, "slow path");

        let result = match kind {
            HelperKind::MonitorEnter => self.helper.monitor_enter(thread, object),
            HelperKind::MonitorExit => self.helper.monitor_exit(thread, object),
        };

        if let Err(err) = &result {
            debug!(thread = %thread.identity(), %kind, error = %err, "monitor helper failed");
        }
        result
    }
}

impl std::fmt::Debug for SlowPathBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlowPathBridge").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassMetadata;
    use crate::error::MonitorError;
    use crate::thread::ThreadRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recording {
        enters: AtomicUsize,
        exits: AtomicUsize,
    }

    impl RuntimeHelper for Recording {
        fn monitor_enter(&self, _thread: &ThreadContext, _object: &ObjectRef) -> MonitorResult<()> {
            self.enters.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn monitor_exit(&self, thread: &ThreadContext, object: &ObjectRef) -> MonitorResult<()> {
            self.exits.fetch_add(1, Ordering::Relaxed);
            Err(MonitorError::IllegalMonitorState {
                thread: thread.identity(),
                object: object.address(),
            })
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let helper = Arc::new(Recording::default());
        let bridge = SlowPathBridge::new(helper.clone());
        let registry = Arc::new(ThreadRegistry::new());
        let thread = ThreadContext::attach(&registry, 32);
        let obj = ObjectRef::allocate(&ClassMetadata::builder("Obj").build());

        assert!(bridge.call_helper(&thread, &obj, HelperKind::MonitorEnter).is_ok());
        assert!(bridge.call_helper(&thread, &obj, HelperKind::MonitorExit).is_err());
        assert_eq!(helper.enters.load(Ordering::Relaxed), 1);
        assert_eq!(helper.exits.load(Ordering::Relaxed), 1);
    }
}
