//! # Sequence Interpreter
//!
//! Executes a [`Sequence`] for one `(thread, object)` pair against the real
//! lock word, one op at a time. Memory operations map onto Rust atomics:
//!
//! | Op | Rust |
//! |----|------|
//! | `PlainLoad` / `PlainStore` | `load` / `store` with `Relaxed` |
//! | `AtomicLoad` | `load(Acquire)` |
//! | `CompareAndSwap` | `compare_exchange(AcqRel, Acquire)` |
//! | `ReleaseFence` | `fence(Release)` |
//!
//! Every executed memory op is counted in [`ExecStats`]. A sequence ends in
//! either `Return` or `CallHelper`; the interpreter never calls the helper
//! itself.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::ExecError;
use crate::heap::ObjectRef;
use crate::monitor_cache::MonitorRecord;
use crate::ops::{HelperKind, Label, Op, Operand, Reg, Sequence};
use crate::stats::ExecStats;
use crate::thread::ThreadContext;

/// The located lock word.
#[derive(Debug)]
enum Slot<'a> {
    Embedded(&'a AtomicUsize),
    Record(Arc<MonitorRecord>),
}

impl Slot<'_> {
    fn word(&self) -> &AtomicUsize {
        match self {
            Slot::Embedded(word) => word,
            Slot::Record(record) => record.alternate_lockword(),
        }
    }
}

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More ops to run.
    Continue,
    /// The sequence returned.
    Done,
    /// The sequence handed off to the helper.
    CallHelper(HelperKind),
}

/// Result of running a sequence to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The fast path completed the operation.
    Done,
    /// The helper must perform the whole operation.
    CallHelper(HelperKind),
}

/// A running sequence.
#[derive(Debug)]
pub struct Machine<'a> {
    seq: &'a Sequence,
    thread: &'a ThreadContext,
    object: &'a ObjectRef,
    pc: usize,
    regs: [usize; Reg::COUNT],
    slot: Option<Slot<'a>>,
    stats: ExecStats,
    finished: Option<Outcome>,
}

impl<'a> Machine<'a> {
    /// Prepare to run `seq` on behalf of `thread` against `object`.
    pub fn new(seq: &'a Sequence, thread: &'a ThreadContext, object: &'a ObjectRef) -> Self {
        Self {
            seq,
            thread,
            object,
            pc: 0,
            regs: [0; Reg::COUNT],
            slot: None,
            stats: ExecStats::default(),
            finished: None,
        }
    }

    /// Position of the next op.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// The next op, unless finished.
    pub fn next_op(&self) -> Option<&Op> {
        match self.finished {
            Some(_) => None,
            None => self.seq.ops().get(self.pc),
        }
    }

    /// Current value of a register.
    pub fn reg(&self, reg: Reg) -> usize {
        self.regs[reg.index()]
    }

    /// Counts of executed ops.
    pub fn stats(&self) -> ExecStats {
        self.stats
    }

    /// The outcome, once finished.
    pub fn outcome(&self) -> Option<Outcome> {
        self.finished
    }

    /// Run to completion.
    pub fn run(&mut self) -> Result<Outcome, ExecError> {
        loop {
            match self.step()? {
                Step::Continue => {}
                Step::Done => return Ok(Outcome::Done),
                Step::CallHelper(kind) => return Ok(Outcome::CallHelper(kind)),
            }
        }
    }

    /// Execute exactly one op.
    pub fn step(&mut self) -> Result<Step, ExecError> {
        if let Some(outcome) = self.finished {
            return Ok(match outcome {
                Outcome::Done => Step::Done,
                Outcome::CallHelper(kind) => Step::CallHelper(kind),
            });
        }

        let pc = self.pc;
        let op = *self.seq.ops().get(pc).ok_or(ExecError::FellOff { pc })?;
        self.pc += 1;

        match op {
            Op::LocateEmbedded { offset } => {
                let object: &'a ObjectRef = self.object;
                let word = object.word_at_offset(offset).ok_or(ExecError::BadOffset { offset })?;
                self.slot = Some(Slot::Embedded(word));
            }
            Op::CacheIndex { dst } => {
                self.set(dst, self.thread.cache_index(self.object.address()));
            }
            Op::CacheProbe { index, miss } => {
                match self.thread.probe_cache(self.reg(index), self.object.address()) {
                    Some(record) => self.slot = Some(Slot::Record(record)),
                    None => {
                        self.stats.cache_misses += 1;
                        self.jump(miss);
                    }
                }
            }
            Op::TestClassFlag { flag, target } => {
                if self.object.class().flags().intersects(flag) {
                    self.jump(target);
                }
            }

            Op::AtomicLoad { dst } => {
                let value = self.word(pc)?.load(Ordering::Acquire);
                self.stats.atomic_loads += 1;
                self.set(dst, value);
            }
            Op::PlainLoad { dst } => {
                let value = self.word(pc)?.load(Ordering::Relaxed);
                self.stats.plain_loads += 1;
                self.set(dst, value);
            }
            Op::CompareAndSwap {
                expected,
                new,
                dst,
                on_fail,
            } => {
                let (expected, new) = (self.reg(expected), self.reg(new));
                let result = self
                    .word(pc)?
                    .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire);
                self.stats.cas_attempts += 1;
                match result {
                    Ok(observed) => self.set(dst, observed),
                    Err(observed) => {
                        self.stats.cas_failures += 1;
                        self.set(dst, observed);
                        self.jump(on_fail);
                    }
                }
            }
            Op::PlainStore { src } => {
                let value = self.reg(src);
                self.word(pc)?.store(value, Ordering::Relaxed);
                self.stats.plain_stores += 1;
            }
            Op::ReleaseFence => {
                fence(Ordering::Release);
                self.stats.fences += 1;
            }

            Op::MoveImm { dst, imm } => self.set(dst, imm),
            Op::LoadThread { dst } => self.set(dst, self.thread.identity().as_usize()),
            Op::AddImm { dst, src, imm } => self.set(dst, self.reg(src).wrapping_add(imm)),
            Op::SubImm { dst, src, imm } => self.set(dst, self.reg(src).wrapping_sub(imm)),
            Op::AndImm { dst, src, imm } => self.set(dst, self.reg(src) & imm),
            Op::AndNotImm { dst, src, imm } => self.set(dst, self.reg(src) & !imm),
            Op::OrImm { dst, src, imm } => self.set(dst, self.reg(src) | imm),

            Op::Branch {
                lhs,
                cond,
                rhs,
                target,
            } => {
                let rhs = match rhs {
                    Operand::Reg(r) => self.reg(r),
                    Operand::Imm(v) => v,
                };
                if cond.holds(self.reg(lhs), rhs) {
                    self.jump(target);
                }
            }
            Op::Jump { target } => self.jump(target),
            Op::CallHelper(kind) => {
                self.stats.helper_calls += 1;
                self.finished = Some(Outcome::CallHelper(kind));
                return Ok(Step::CallHelper(kind));
            }
            Op::Return => {
                self.finished = Some(Outcome::Done);
                return Ok(Step::Done);
            }
        }

        Ok(Step::Continue)
    }

    fn word(&self, pc: usize) -> Result<&AtomicUsize, ExecError> {
        self.slot.as_ref().map(Slot::word).ok_or(ExecError::NoSlot { pc })
    }

    fn set(&mut self, reg: Reg, value: usize) {
        self.regs[reg.index()] = value;
    }

    fn jump(&mut self, label: Label) {
        self.pc = self.seq.target(label);
    }
}
