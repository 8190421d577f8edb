//! # Tasuki Runtime Library
//!
//! Fast paths for Java object-monitor enter and exit, as a compiling VM
//! emits them at every `synchronized` boundary:
//!
//! - **Lock Word**: bit-encoded owner, reservation, recursion and overflow
//! - **Fast Path Selection**: per lock site, pick the counting lock, the
//!   reservation-biased lock, or a plain call into the runtime
//! - **Protocols**: lowering of each variant to an abstract operation stream
//! - **Monitor Cache**: per-thread lookup of out-of-line lock words
//! - **Slow Path**: the runtime helper contract and a CAS-only reference helper
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        MONITOR SYSTEM                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Selector   │─▶│   Lowering   │─▶│  Interpreter │          │
//! │  │(selector.rs) │  │  (lower.rs)  │  │  (interp.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │          counting.rs              │                   │
//! │         │          reservation.rs           │ call-helper       │
//! │         ▼                                   ▼                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Locator    │  │ Monitor Cache│  │  Slow Path   │          │
//! │  │  (class.rs)  │  │(monitor_cache│  │ (bridge.rs,  │          │
//! │  │              │  │     .rs)     │  │  runtime.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tasuki_runtime::{ClassMetadata, LockSiteProfile, MonitorConfig, MonitorSystem, ObjectRef};
//!
//! let system = MonitorSystem::new(MonitorConfig::default())?;
//! let thread = system.attach_thread();
//! let class = ClassMetadata::builder("Account").fields(2).build();
//! let site = system.compile_site(&class, &LockSiteProfile::for_class(&class))?;
//!
//! let account = ObjectRef::allocate(&class);
//! system.monitor_enter(&thread, &site, &account)?;
//! // ... critical section ...
//! system.monitor_exit(&thread, &site, &account)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod class;
pub mod config;
pub mod counting;
pub mod error;
pub mod heap;
pub mod interp;
pub mod lockword;
pub mod log;
pub mod lower;
pub mod monitor_cache;
pub mod ops;
pub mod reservation;
pub mod runtime;
pub mod selector;
pub mod stats;
pub mod thread;

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, warn};

// Re-exports
pub use bridge::{RuntimeHelper, SlowPathBridge};
pub use class::{ClassFlags, ClassId, ClassMetadata, DisallowsLocking, LockWordLocation, LockWordLocator};
pub use config::{ConfigError, LogFormat, LogLevel, MonitorConfig, MonitorConfigBuilder};
pub use error::{ExecError, LocateError, LoweringError, MonitorError, MonitorResult};
pub use heap::{ObjectRef, WeakObjectRef};
pub use interp::{Machine, Outcome, Step};
pub use lockword::{LockWord, ThreadIdentity};
pub use lower::CompiledLockSite;
pub use monitor_cache::{MonitorCache, MonitorRecord, MonitorTable};
pub use ops::{HelperKind, Op, Sequence};
pub use runtime::MonitorRuntime;
pub use selector::{FastPathPlan, FastPathSelector, LockSiteProfile, Protocol};
pub use stats::{ExecStats, MonitorStatsSnapshot};
pub use thread::{ThreadContext, ThreadRegistry};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global monitor configuration.
static MONITOR_CONFIG: OnceLock<MonitorConfig> = OnceLock::new();

/// Get the configuration the process was initialized with.
///
/// Returns `None` if neither [`init_with`] nor [`init_from_env`] ran.
pub fn monitor_config() -> Option<&'static MonitorConfig> {
    MONITOR_CONFIG.get()
}

/// Initialize logging and build a monitor system from `config`.
///
/// The first configuration passed here is stored globally.
pub fn init_with(config: MonitorConfig) -> Result<MonitorSystem, ConfigError> {
    config.validate()?;
    log::init(&config.log);
    let _ = MONITOR_CONFIG.set(config.clone());
    info!(
        version = VERSION,
        reservation = config.reservation_available(),
        inline = config.inline_monitors,
        cache_size = config.cache.size,
        "monitor system initialized"
    );
    MonitorSystem::new(config)
}

/// Initialize from `TASUKI_*` environment variables.
///
/// See [`MonitorConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Result<MonitorSystem, ConfigError> {
    init_with(MonitorConfig::from_env())
}

// ============================================================================
// Monitor System
// ============================================================================

/// Everything needed to compile lock sites and run them.
#[derive(Debug)]
pub struct MonitorSystem {
    config: MonitorConfig,
    selector: FastPathSelector,
    locator: LockWordLocator,
    table: Arc<MonitorTable>,
    registry: Arc<ThreadRegistry>,
    runtime: Option<Arc<MonitorRuntime>>,
    bridge: SlowPathBridge,
}

impl MonitorSystem {
    /// Build a system backed by the reference [`MonitorRuntime`].
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let table = Arc::new(MonitorTable::new());
        let registry = Arc::new(ThreadRegistry::new());
        let runtime = Arc::new(MonitorRuntime::new(Arc::clone(&table), Arc::clone(&registry)));
        Ok(Self {
            selector: FastPathSelector::new(&config),
            locator: LockWordLocator::new(),
            bridge: SlowPathBridge::new(runtime.clone()),
            runtime: Some(runtime),
            table,
            registry,
            config,
        })
    }

    /// Build a system around a custom runtime helper.
    pub fn with_helper(config: MonitorConfig, helper: Arc<dyn RuntimeHelper>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            selector: FastPathSelector::new(&config),
            locator: LockWordLocator::new(),
            bridge: SlowPathBridge::new(helper),
            runtime: None,
            table: Arc::new(MonitorTable::new()),
            registry: Arc::new(ThreadRegistry::new()),
            config,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The lock word locator.
    pub fn locator(&self) -> &LockWordLocator {
        &self.locator
    }

    /// The thread registry.
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// The monitor table.
    pub fn table(&self) -> &Arc<MonitorTable> {
        &self.table
    }

    /// The reference helper, unless a custom one was supplied.
    pub fn runtime(&self) -> Option<&Arc<MonitorRuntime>> {
        self.runtime.as_ref()
    }

    /// Helper counters, when running on the reference helper.
    pub fn runtime_stats(&self) -> Option<MonitorStatsSnapshot> {
        self.runtime.as_ref().map(|rt| rt.stats().snapshot())
    }

    /// Attach the calling thread.
    pub fn attach_thread(&self) -> ThreadContext {
        ThreadContext::attach(&self.registry, self.config.cache.size)
    }

    /// Select and lower the fast paths of a lock site on `class`.
    pub fn compile_site(&self, class: &ClassMetadata, profile: &LockSiteProfile) -> Result<CompiledLockSite, LoweringError> {
        let plan = self.selector.select(&self.locator, class, profile);
        lower::lower(class.id(), plan)
    }

    /// Current lock word of `object`, wherever it lives.
    pub fn lock_word(&self, object: &ObjectRef) -> LockWord {
        match object.lock_word() {
            Some(word) => word,
            None => self
                .table
                .get(object)
                .map(|record| record.lock_word())
                .unwrap_or(LockWord::UNLOCKED),
        }
    }

    /// Recursion depth of `object` tracked outside its lock word.
    pub fn overflow_depth(&self, object: &ObjectRef) -> usize {
        self.table
            .get(object)
            .map(|record| record.overflow_depth().load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Enter the monitor of `object` through `site`.
    ///
    /// Fails with [`MonitorError::InsidePrimitiveRegion`] while the thread
    /// is inside a primitive locked region.
    pub fn monitor_enter(&self, thread: &ThreadContext, site: &CompiledLockSite, object: &ObjectRef) -> MonitorResult<()> {
        if thread.in_primitive_region() {
            return Err(MonitorError::InsidePrimitiveRegion {
                thread: thread.identity(),
            });
        }
        if !site.accepts(object.class()) {
            return self.mismatched(thread, site, object, HelperKind::MonitorEnter);
        }
        let primitive = site.holds_lease_across_region();

        thread.acquire_lease();
        let outcome = self.run_fast_path(thread, site.enter(), object, HelperKind::MonitorEnter);
        match outcome {
            Outcome::Done if primitive => {}
            Outcome::Done => thread.release_lease(),
            Outcome::CallHelper(kind) => {
                thread.release_lease();
                self.bridge.call_helper(thread, object, kind)?;
                if primitive {
                    thread.acquire_lease();
                }
            }
        }

        if primitive {
            thread.enter_primitive_region();
        }
        Ok(())
    }

    /// Exit the monitor of `object` through `site`.
    pub fn monitor_exit(&self, thread: &ThreadContext, site: &CompiledLockSite, object: &ObjectRef) -> MonitorResult<()> {
        let inline = site.accepts(object.class());
        if inline && site.holds_lease_across_region() {
            thread.exit_primitive_region();
        }
        if thread.in_primitive_region() {
            return Err(MonitorError::InsidePrimitiveRegion {
                thread: thread.identity(),
            });
        }
        if !inline {
            return self.mismatched(thread, site, object, HelperKind::MonitorExit);
        }
        if !thread.holds_lease() {
            thread.acquire_lease();
        }

        let outcome = self.run_fast_path(thread, site.exit(), object, HelperKind::MonitorExit);
        thread.release_lease();
        match outcome {
            Outcome::Done => Ok(()),
            Outcome::CallHelper(kind) => self.bridge.call_helper(thread, object, kind),
        }
    }

    /// The site's sequences assume a different lock word location than
    /// `object` has; only the helper can lock it.
    fn mismatched(&self, thread: &ThreadContext, site: &CompiledLockSite, object: &ObjectRef, kind: HelperKind) -> MonitorResult<()> {
        debug!(
            site_class = %site.class(),
            object_class = %object.class().id(),
            %kind,
            "lock site does not fit the object layout; using the runtime helper"
        );
        self.bridge.call_helper(thread, object, kind)
    }

    fn run_fast_path(&self, thread: &ThreadContext, seq: &Sequence, object: &ObjectRef, kind: HelperKind) -> Outcome {
        let mut machine = Machine::new(seq, thread, object);
        let result = machine.run();
        thread.record(machine.stats());
        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(sequence = seq.name(), error = %err, "fast path faulted; using the runtime helper");
                Outcome::CallHelper(kind)
            }
        }
    }
}
