//! # Lock Site Lowering
//!
//! Turns a [`FastPathPlan`] into the enter and exit [`Sequence`]s of a lock
//! site. Every inline sequence has the same frame:
//!
//! ```text
//!   [tstcls DISALLOWS_LOCKING, slow]     enter only, when the plan is guarded
//!   lea slot, [obj+offset]               or: cidx index; cprobe slot, index, miss slow
//!   ldthr thread
//!   <protocol body>                      every success path ends in ret
//! slow:
//!   call monitorEnter | monitorExit
//! ```

use crate::class::{ClassFlags, ClassId, ClassMetadata, LockWordLocation};
use crate::counting;
use crate::error::LoweringError;
use crate::ops::{HelperKind, Op, Reg, Sequence, SequenceBuilder};
use crate::reservation;
use crate::selector::{FastPathPlan, Protocol};

/// Enter and exit sequences of one lock site.
#[derive(Debug, Clone)]
pub struct CompiledLockSite {
    class: ClassId,
    plan: FastPathPlan,
    enter: Sequence,
    exit: Sequence,
}

impl CompiledLockSite {
    /// Class the site was compiled against.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// The selected plan.
    pub fn plan(&self) -> FastPathPlan {
        self.plan
    }

    /// Enter sequence.
    pub fn enter(&self) -> &Sequence {
        &self.enter
    }

    /// Exit sequence.
    pub fn exit(&self) -> &Sequence {
        &self.exit
    }

    /// Whether the inline sequences can run on instances of `class`.
    ///
    /// The sequences hard-code where the lock word lives. A class that keeps
    /// it elsewhere must go through the helper.
    pub fn accepts(&self, class: &ClassMetadata) -> bool {
        match self.plan {
            FastPathPlan::CallOut(_) => true,
            FastPathPlan::Inline {
                location: LockWordLocation::Embedded(offset),
                ..
            } => class.lock_word_offset() == Some(offset),
            FastPathPlan::Inline {
                location: LockWordLocation::UseCache,
                ..
            } => class.lock_word_offset().is_none(),
        }
    }

    /// Whether the owner keeps its access lease across the locked region.
    pub fn holds_lease_across_region(&self) -> bool {
        self.plan.protocol() == Some(Protocol::Reservation { primitive: true })
    }
}

/// Lower a plan for `class`.
pub fn lower(class: ClassId, plan: FastPathPlan) -> Result<CompiledLockSite, LoweringError> {
    Ok(CompiledLockSite {
        class,
        plan,
        enter: lower_one(class, plan, HelperKind::MonitorEnter)?,
        exit: lower_one(class, plan, HelperKind::MonitorExit)?,
    })
}

fn sequence_name(class: ClassId, plan: FastPathPlan, kind: HelperKind) -> String {
    let op = match kind {
        HelperKind::MonitorEnter => "monent",
        HelperKind::MonitorExit => "monexit",
    };
    let flavor = match plan.protocol() {
        None => "callout",
        Some(Protocol::Counting) => "counting",
        Some(Protocol::Reservation { primitive: false }) => "reserving",
        Some(Protocol::Reservation { primitive: true }) => "reserving.primitive",
    };
    format!("{}.{} {}", op, flavor, class)
}

fn lower_one(class: ClassId, plan: FastPathPlan, kind: HelperKind) -> Result<Sequence, LoweringError> {
    let mut b = SequenceBuilder::new(sequence_name(class, plan, kind));

    let (location, guard, protocol) = match plan {
        FastPathPlan::CallOut(_) => {
            b.emit(Op::CallHelper(kind));
            return b.finish();
        }
        FastPathPlan::Inline {
            location,
            guard,
            protocol,
        } => (location, guard, protocol),
    };

    let slow = b.new_label();

    if guard && kind == HelperKind::MonitorEnter {
        b.emit(Op::TestClassFlag {
            flag: ClassFlags::DISALLOWS_LOCKING,
            target: slow,
        });
    }

    match location {
        LockWordLocation::Embedded(offset) => {
            b.emit(Op::LocateEmbedded { offset });
        }
        LockWordLocation::UseCache => {
            b.emit(Op::CacheIndex { dst: Reg::Index });
            b.emit(Op::CacheProbe {
                index: Reg::Index,
                miss: slow,
            });
        }
    }
    b.emit(Op::LoadThread { dst: Reg::Thread });

    match (protocol, kind) {
        (Protocol::Counting, HelperKind::MonitorEnter) => counting::emit_enter(&mut b, slow),
        (Protocol::Counting, HelperKind::MonitorExit) => counting::emit_exit(&mut b, slow),
        (Protocol::Reservation { primitive }, HelperKind::MonitorEnter) => {
            reservation::emit_enter(&mut b, slow, primitive)
        }
        (Protocol::Reservation { primitive }, HelperKind::MonitorExit) => {
            reservation::emit_exit(&mut b, slow, primitive)
        }
    }

    b.bind(slow);
    b.emit(Op::CallHelper(kind));
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::CallOutReason;

    fn class_id() -> ClassId {
        ClassMetadata::builder("Site").build().id()
    }

    fn inline(location: LockWordLocation, guard: bool, protocol: Protocol) -> FastPathPlan {
        FastPathPlan::Inline {
            location,
            guard,
            protocol,
        }
    }

    #[test]
    fn test_callout_is_single_call() {
        let site = lower(class_id(), FastPathPlan::CallOut(CallOutReason::InlineDisabled)).unwrap();
        assert_eq!(site.enter().ops(), &[Op::CallHelper(HelperKind::MonitorEnter)]);
        assert_eq!(site.exit().ops(), &[Op::CallHelper(HelperKind::MonitorExit)]);
    }

    #[test]
    fn test_guard_only_on_enter() {
        let plan = inline(LockWordLocation::Embedded(8), true, Protocol::Counting);
        let site = lower(class_id(), plan).unwrap();
        assert!(matches!(site.enter().ops()[0], Op::TestClassFlag { .. }));
        assert_eq!(site.exit().count(|op| matches!(op, Op::TestClassFlag { .. })), 0);
    }

    #[test]
    fn test_accepts_only_matching_layouts() {
        let embedded = ClassMetadata::builder("Embedded").fields(2).build();
        let shifted = ClassMetadata::builder("Shifted").fields(2).lock_word_at(16).build();
        let bare = ClassMetadata::builder("Bare").embedded_lock_word(false).fields(2).build();

        let site = lower(embedded.id(), inline(LockWordLocation::Embedded(8), false, Protocol::Counting)).unwrap();
        assert!(site.accepts(&embedded));
        assert!(!site.accepts(&shifted));
        assert!(!site.accepts(&bare));

        let site = lower(bare.id(), inline(LockWordLocation::UseCache, false, Protocol::Counting)).unwrap();
        assert!(site.accepts(&bare));
        assert!(!site.accepts(&embedded));

        let site = lower(bare.id(), FastPathPlan::CallOut(CallOutReason::InlineDisabled)).unwrap();
        assert!(site.accepts(&embedded) && site.accepts(&bare));
    }

    #[test]
    fn test_cache_location_probes() {
        let plan = inline(LockWordLocation::UseCache, false, Protocol::Reservation { primitive: false });
        let site = lower(class_id(), plan).unwrap();
        for seq in [site.enter(), site.exit()] {
            assert!(matches!(seq.ops()[0], Op::CacheIndex { dst: Reg::Index }));
            assert!(matches!(seq.ops()[1], Op::CacheProbe { .. }));
        }
    }

    #[test]
    fn test_every_plan_lowers() {
        let protocols = [
            Protocol::Counting,
            Protocol::Reservation { primitive: false },
            Protocol::Reservation { primitive: true },
        ];
        for location in [LockWordLocation::Embedded(8), LockWordLocation::UseCache] {
            for guard in [false, true] {
                for protocol in protocols {
                    let site = lower(class_id(), inline(location, guard, protocol)).unwrap();
                    assert!(site.enter().calls(HelperKind::MonitorEnter));
                    assert!(site.exit().calls(HelperKind::MonitorExit));
                    assert!(!site.enter().calls(HelperKind::MonitorExit));
                }
            }
        }
    }

    #[test]
    fn test_lease_across_region_only_for_primitive_reservation() {
        let id = class_id();
        let primitive = lower(id, inline(LockWordLocation::Embedded(8), false, Protocol::Reservation { primitive: true })).unwrap();
        let counting = lower(id, inline(LockWordLocation::Embedded(8), false, Protocol::Counting)).unwrap();
        assert!(primitive.holds_lease_across_region());
        assert!(!counting.holds_lease_across_region());
    }

    #[test]
    fn test_sequence_names() {
        let id = class_id();
        let site = lower(id, inline(LockWordLocation::Embedded(8), false, Protocol::Reservation { primitive: true })).unwrap();
        assert_eq!(site.enter().name(), format!("monent.reserving.primitive {}", id));
        assert_eq!(site.exit().name(), format!("monexit.reserving.primitive {}", id));
    }
}
