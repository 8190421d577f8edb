//! # Counting Protocol
//!
//! The plain recursive CAS lock. The lock word is either `0`, or
//! `owner | recursion` while held.
//!
//! Enter:
//! - `0` → CAS to `self | 1`; retry on a lost race.
//! - owned by self with room in the recursion field → plain store of
//!   `word + 1`. Only the holder mutates a held word.
//! - anything else → helper.
//!
//! Exit:
//! - owned by self with recursion 1 → release fence, then store `0`.
//! - owned by self with recursion above 1 → plain store of `word - 1`.
//! - anything else → helper.
//!
//! A word reserved to the current thread is treated as owned by self: the
//! recursion field is updated in place and the reservation survives the
//! last exit.

use crate::lockword::bits::{INC, RECURSION_MASK};
use crate::lockword::masks::COUNTING_OWNING_COMPLEMENT;
use crate::ops::{Cond, Label, Op, Operand, Reg, SequenceBuilder};

/// Emit the enter fast path. Expects the slot resolved and the thread
/// identity in [`Reg::Thread`]; falls through nowhere.
pub fn emit_enter(b: &mut SequenceBuilder, slow: Label) {
    let retry = b.new_label();
    let not_free = b.new_label();

    b.bind(retry);
    b.emit(Op::AtomicLoad { dst: Reg::Word });
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Ne,
        rhs: Operand::Imm(0),
        target: not_free,
    });
    b.emit(Op::AddImm {
        dst: Reg::Value,
        src: Reg::Thread,
        imm: INC,
    });
    b.emit(Op::MoveImm { dst: Reg::Temp, imm: 0 });
    b.emit(Op::CompareAndSwap {
        expected: Reg::Temp,
        new: Reg::Value,
        dst: Reg::Word,
        on_fail: retry,
    });
    b.emit(Op::Return);

    // Recursive enter by the owner.
    b.bind(not_free);
    b.emit(Op::AndNotImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: COUNTING_OWNING_COMPLEMENT,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Thread),
        target: slow,
    });
    // Bare `self` (not held, not reserved) is never produced; leave it alone.
    b.emit(Op::Branch {
        lhs: Reg::Word,
        cond: Cond::Eq,
        rhs: Operand::Reg(Reg::Thread),
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
        rhs: Operand::Imm(RECURSION_MASK),
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

/// Emit the exit fast path. Same register contract as [`emit_enter`].
pub fn emit_exit(b: &mut SequenceBuilder, slow: Label) {
    let last = b.new_label();
    let publish = b.new_label();

    b.emit(Op::PlainLoad { dst: Reg::Word });
    b.emit(Op::AndNotImm {
        dst: Reg::Temp,
        src: Reg::Word,
        imm: COUNTING_OWNING_COMPLEMENT,
    });
    b.emit(Op::Branch {
        lhs: Reg::Temp,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Thread),
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
        rhs: Operand::Imm(INC),
        target: last,
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

    // Last hold: drop to `0`, or back to `self | RESERVED`.
    b.bind(last);
    b.emit(Op::AndNotImm {
        dst: Reg::Value,
        src: Reg::Word,
        imm: RECURSION_MASK,
    });
    b.emit(Op::Branch {
        lhs: Reg::Value,
        cond: Cond::Ne,
        rhs: Operand::Reg(Reg::Thread),
        target: publish,
    });
    b.emit(Op::MoveImm { dst: Reg::Value, imm: 0 });
    b.bind(publish);
    b.emit(Op::ReleaseFence);
    b.emit(Op::PlainStore { src: Reg::Value });
    b.emit(Op::Return);
}
