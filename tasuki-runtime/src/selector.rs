//! # Fast Path Selection
//!
//! Decides, once per lock site, which protocol guards it:
//!
//! 1. Classes that always disallow locking call out.
//! 2. Classes whose status is unknown get a runtime class-flag guard in
//!    front of the fast path.
//! 3. Without reservation (disabled, or no atomic CAS on the platform) the
//!    counting protocol is used.
//! 4. Otherwise the reservation protocol, in its primitive or
//!    non-primitive form.
//!
//! A class whose lock word cannot be located also calls out, as does every
//! site when inline monitors are switched off.

use tracing::debug;

use crate::class::{ClassMetadata, DisallowsLocking, LockWordLocation, LockWordLocator};
use crate::config::MonitorConfig;
use crate::error::LocateError;

/// Compiler-supplied facts about one lock site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSiteProfile {
    /// The region provably cannot re-enter this monitor.
    pub primitive_region: bool,
    /// Reservation is statically allowed for this site.
    pub reservation_eligible: bool,
    /// What is known about the class forbidding locking.
    pub disallows_locking: DisallowsLocking,
}

/// Assumes nothing about the class: the site gets a runtime guard. Use
/// [`LockSiteProfile::for_class`] when the class is known at compile time.
impl Default for LockSiteProfile {
    fn default() -> Self {
        Self {
            primitive_region: false,
            reservation_eligible: true,
            disallows_locking: DisallowsLocking::Unknown,
        }
    }
}

impl LockSiteProfile {
    /// Profile derived from what the class itself says.
    pub fn for_class(class: &ClassMetadata) -> Self {
        Self {
            disallows_locking: class.disallows_locking(),
            ..Self::default()
        }
    }

    /// Mark the region primitive.
    pub fn primitive(mut self, primitive: bool) -> Self {
        self.primitive_region = primitive;
        self
    }

    /// Allow or forbid reservation.
    pub fn reservation(mut self, eligible: bool) -> Self {
        self.reservation_eligible = eligible;
        self
    }

    /// Override the locking status.
    pub fn disallows(mut self, status: DisallowsLocking) -> Self {
        self.disallows_locking = status;
        self
    }
}

/// The inline protocol chosen for a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain recursive CAS lock.
    Counting,
    /// Reservation-biased lock.
    Reservation {
        /// Region cannot recurse.
        primitive: bool,
    },
}

/// Why a site always calls the runtime helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOutReason {
    /// Inline monitors are disabled.
    InlineDisabled,
    /// The class always disallows locking.
    LockingDisallowed,
    /// The class could not be located.
    Unlocatable,
}

/// Result of selection for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FastPathPlan {
    /// Enter and exit are plain helper calls.
    CallOut(CallOutReason),
    /// Inline fast paths.
    Inline {
        /// Where the lock word lives.
        location: LockWordLocation,
        /// Emit the runtime disallows-locking guard.
        guard: bool,
        /// Protocol to lower.
        protocol: Protocol,
    },
}

impl FastPathPlan {
    /// The inline protocol, if any.
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            FastPathPlan::Inline { protocol, .. } => Some(*protocol),
            FastPathPlan::CallOut(_) => None,
        }
    }
}

/// Chooses a [`FastPathPlan`] per lock site.
#[derive(Debug, Clone, Copy)]
pub struct FastPathSelector {
    inline_monitors: bool,
    reservation_available: bool,
}

impl FastPathSelector {
    /// Create a selector from configuration.
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            inline_monitors: config.inline_monitors,
            reservation_available: config.reservation_available(),
        }
    }

    /// Select the plan for a site locking instances of `class`.
    pub fn select(&self, locator: &LockWordLocator, class: &ClassMetadata, profile: &LockSiteProfile) -> FastPathPlan {
        let plan = self.decide(locator, class, profile);
        debug!(class = %class.id(), name = class.name(), ?profile, ?plan, "selected monitor fast path");
        plan
    }

    fn decide(&self, locator: &LockWordLocator, class: &ClassMetadata, profile: &LockSiteProfile) -> FastPathPlan {
        if !self.inline_monitors {
            return FastPathPlan::CallOut(CallOutReason::InlineDisabled);
        }

        let guard = match profile.disallows_locking {
            DisallowsLocking::Always => return FastPathPlan::CallOut(CallOutReason::LockingDisallowed),
            DisallowsLocking::Unknown => true,
            DisallowsLocking::Never => false,
        };

        let location = match locator.locate(class) {
            Ok(location) => location,
            Err(LocateError::Unresolved { .. } | LocateError::Misaligned { .. }) => {
                return FastPathPlan::CallOut(CallOutReason::Unlocatable)
            }
        };

        let protocol = if self.reservation_available && profile.reservation_eligible {
            Protocol::Reservation {
                primitive: profile.primitive_region,
            }
        } else {
            Protocol::Counting
        };

        FastPathPlan::Inline {
            location,
            guard,
            protocol,
        }
    }
}
