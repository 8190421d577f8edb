//! # Reservation Protocol
//!
//! A lock that stays reserved (biased) toward the last thread that took it.
//! Once the word reads `self | RESERVED`, the owner enters and exits with
//! plain loads and stores only. Any other thread must first get the
//! reservation cancelled by the runtime helper, which does so while holding
//! the owner's access lease; the owner holds that lease for the whole of
//! every fast-path sequence, so the owner's plain stores never race a
//! cancelling CAS.
//!
//! ## Non-primitive regions
//!
//! ```text
//! enter:  word == self|RES                    → store self|RES|1
//!         word == 0                           → CAS 0 → self|RES|1 (retry on failure)
//!         word & !0x70 == self|RES            → store word + 1   (recursion < 8)
//!         otherwise                           → helper
//!
//! exit:   word == self|RES|1                  → release fence, store self|RES
//!         word & !0xF0 == self|RES, rec >= 2  → store word - 1
//!         otherwise                           → helper
//! ```
//!
//! The nested-enter mask leaves the top recursion bit visible, so counts of
//! eight and above are incremented by the helper. FLC is never masked, so
//! an overflowed word always reaches the helper.
//!
//! ## Primitive regions
//!
//! The region cannot recurse, so no counting happens at all. The word
//! `self|RES` itself stands for "held" while the owner is inside the
//! region, and the owner keeps its access lease until the region ends.
//!
//! ```text
//! enter:  word == self|RES                    → done
//!         word == 0                           → CAS 0 → self|RES
//!         word & !0xF0 == self|RES            → done (held by an enclosing region)
//!         otherwise                           → helper
//!
//! exit:   word == self|RES                    → done
//!         word & !0xF0 == self|RES, rec != 0  → done
//!         otherwise                           → helper
//! ```

use crate::lockword::bits::{INC, RECURSION_MASK, RESERVED};
use crate::lockword::masks::{
    RES_NON_PRIMITIVE_ENTER, RES_NON_PRIMITIVE_EXIT, RES_OWNING_COMPLEMENT, RES_PRIMITIVE_ENTER,
};
use crate::ops::{Cond, Label, Op, Operand, Reg, SequenceBuilder};

/// Emit the enter fast path. Expects the slot resolved and the thread
/// identity in [`Reg::Thread`].
pub fn emit_enter(b: &mut SequenceBuilder, slow: Label, primitive: bool) {
    if primitive {
        emit_primitive_enter(b, slow);
    } else {
        emit_non_primitive_enter(b, slow);
    }
}

/// Emit the exit fast path.
pub fn emit_exit(b: &mut SequenceBuilder, slow: Label, primitive: bool) {
    if primitive {
        emit_primitive_exit(b, slow);
    } else {
        emit_non_primitive_exit(b, slow);
    }
}

fn emit_non_primitive_enter(b: &mut SequenceBuilder, slow: Label) {
    let retry = b.new_label();
    let nested = b.new_label();

    // Reserved to self and unlocked.
    b.emit(Op::PlainLoad { dst: Reg::Word });
    b.emit(Op::OrImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: RESERVED,
    });
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Value),
        target: retry,
    });
    b.emit(Op::AddImm {
        dst: Reg::Value,
        src: Reg::Value,
        imm: INC,
    });
    b.emit(Op::PlainStore { src: Reg::Value });
    b.emit(Op::Return);

    // Establish a reservation on a free word.
    b.bind(retry);
    b.emit(Op::AtomicLoad { dst: Reg::Word });
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Ne,
        rhs: Operand::Imm(0),
        target: nested,
    });
    b.emit(Op::OrImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: RESERVED | INC,
    });
    b.emit(Op::MoveImm { dst: Reg::Temp, imm: 0 });
    b.emit(Op::CompareAndSwap {
        expected: Reg::Temp,
        new: Reg::Value,
        dst: Reg::Word,
        on_fail: retry,
    });
    b.emit(Op::Return);

    // Nested enter on a word reserved to self.
    b.bind(nested);
    b.emit(Op::AndNotImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: RES_NON_PRIMITIVE_ENTER,
    });
    b.emit(Op::OrImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: RESERVED,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Value),
        target: slow,
    });
    b.emit(Op::AddImm {
        dst: Reg::Value,
        src: Reg::Word,
        imm: INC,
    });
    b.emit(Op::PlainStore { src: Reg::Value });
    b.emit(Op::Return);
}

fn emit_non_primitive_exit(b: &mut SequenceBuilder, slow: Label) {
    let nested = b.new_label();

    b.emit(Op::PlainLoad { dst: Reg::Word });
    b.emit(Op::OrImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: RESERVED | INC,
    });
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Value),
        target: nested,
    });
    b.emit(Op::AndNotImm {
        dst: Reg::Value,
        src: Reg::Value,
        imm: INC,
    });
    b.emit(Op::ReleaseFence);
    b.emit(Op::PlainStore { src: Reg::Value });
    b.emit(Op::Return);

    b.bind(nested);
    b.emit(Op::AndNotImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: RES_OWNING_COMPLEMENT,
    });
    b.emit(Op::OrImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: RESERVED,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Value),
        target: slow,
    });
    b.emit(Op::AndImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: RES_NON_PRIMITIVE_EXIT,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Eq,
        rhs: Operand::Imm(0),
        target: slow,
    });
    b.emit(Op::SubImm {
        dst: Reg::Value,
        src: Reg::Word,
        imm: INC,
    });
    b.emit(Op::PlainStore { src: Reg::Value });
    b.emit(Op::Return);
}

fn emit_primitive_enter(b: &mut SequenceBuilder, slow: Label) {
    let retry = b.new_label();
    let enclosed = b.new_label();
    let done = b.new_label();

    b.emit(Op::PlainLoad { dst: Reg::Word });
    b.emit(Op::OrImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: RESERVED,
    });
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Eq,
        rhs: Operand::Reg(Reg::Value),
        target: done,
    });

    b.bind(retry);
    b.emit(Op::AtomicLoad { dst: Reg::Word });
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Ne,
        rhs: Operand::Imm(0),
        target: enclosed,
    });
    b.emit(Op::MoveImm { dst: Reg::Temp, imm: 0 });
    b.emit(Op::CompareAndSwap {
        expected: Reg::Temp,
        new: Reg::Value,
        dst: Reg::Word,
        on_fail: retry,
    });
    b.emit(Op::Return);

    b.bind(enclosed);
    b.emit(Op::AndNotImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: RES_PRIMITIVE_ENTER,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Value),
        target: slow,
    });
    b.bind(done);
    b.emit(Op::Return);
}

fn emit_primitive_exit(b: &mut SequenceBuilder, slow: Label) {
    let done = b.new_label();

    b.emit(Op::PlainLoad { dst: Reg::Word });
    b.emit(Op::OrImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: RESERVED,
    });
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Eq,
        rhs: Operand::Reg(Reg::Value),
        target: done,
    });
    b.emit(Op::AndNotImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: RES_OWNING_COMPLEMENT,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Value),
        target: slow,
    });
    b.emit(Op::AndImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: RECURSION_MASK,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Eq,
        rhs: Operand::Imm(0),
        target: slow,
    });
    b.bind(done);
    b.emit(Op::Return);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{HelperKind, Sequence};

    fn build(primitive: bool, enter: bool) -> Sequence {
        let mut b = SequenceBuilder::new("reservation");
        let slow = b.new_label();
        b.emit(Op::LocateEmbedded { offset: 8 });
        b.emit(Op::LoadThread { dst: Reg::Thread });
        let kind = if enter {
            emit_enter(&mut b, slow, primitive);
            HelperKind::MonitorEnter
        } else {
            emit_exit(&mut b, slow, primitive);
            HelperKind::MonitorExit
        };
        b.bind(slow);
        b.emit(Op::CallHelper(kind));
        b.finish().unwrap()
    }

    #[test]
    fn test_every_variant_lowers() {
        for primitive in [false, true] {
            for enter in [false, true] {
                let seq = build(primitive, enter);
                assert!(matches!(seq.ops().last(), Some(Op::CallHelper(_))));
            }
        }
    }

    #[test]
    fn test_exits_never_use_atomics() {
        assert_eq!(build(false, false).count(Op::is_atomic), 0);
        assert_eq!(build(true, false).count(Op::is_atomic), 0);
    }

    #[test]
    fn test_primitive_sequences_never_store_plainly() {
        let enter = build(true, true);
        let exit = build(true, false);
        assert_eq!(enter.count(|op| matches!(op, Op::PlainStore { .. })), 0);
        assert_eq!(exit.count(|op| matches!(op, Op::PlainStore { .. })), 0);
    }

    #[test]
    fn test_non_primitive_exit_fences_once() {
        let seq = build(false, false);
        assert_eq!(seq.count(|op| matches!(op, Op::ReleaseFence)), 1);
    }

    #[test]
    fn test_enter_reads_plainly_before_any_atomic() {
        let seq = build(false, true);
        let first_load = seq
            .ops()
            .iter()
            .position(|op| matches!(op, Op::PlainLoad { .. } | Op::AtomicLoad { .. }))
            .unwrap();
        assert!(matches!(seq.ops()[first_load], Op::PlainLoad { .. }));
    }
}
