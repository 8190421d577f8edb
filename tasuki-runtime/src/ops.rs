//! # Abstract Operation Stream
//!
//! The protocols lower a monitor enter or exit into a [`Sequence`] of
//! [`Op`]s. An emission backend turns a sequence into machine code; the
//! [`interp`](crate::interp) module executes it directly.
//!
//! ## Machine model
//!
//! - Five word registers ([`Reg`]).
//! - One implicit *slot*: the address of the lock word being operated on.
//!   It is set by [`Op::LocateEmbedded`] or by a successful
//!   [`Op::CacheProbe`], and every memory operation addresses it.
//! - Labels are created up front and bound to positions while emitting;
//!   [`SequenceBuilder::finish`] checks that every label used is bound.

use std::fmt;

use crate::class::ClassFlags;
use crate::error::LoweringError;

/// A word register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// The lock word as last loaded or observed.
    Word,
    /// The value to store or swap in.
    Value,
    /// Scratch.
    Temp,
    /// The current thread identity.
    Thread,
    /// Monitor cache index.
    Index,
}

impl Reg {
    /// Number of registers.
    pub const COUNT: usize = 5;

    /// Register file index.
    pub fn index(self) -> usize {
        match self {
            Reg::Word => 0,
            Reg::Value => 1,
            Reg::Temp => 2,
            Reg::Thread => 3,
            Reg::Index => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Reg::Word => "word",
            Reg::Value => "value",
            Reg::Temp => "temp",
            Reg::Thread => "thread",
            Reg::Index => "index",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A register.
    Reg(Reg),
    /// An immediate.
    Imm(usize),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(v) => write!(f, "{:#x}", v),
        }
    }
}

/// Unsigned comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `>=`
    Ge,
}

impl Cond {
    /// Evaluate the condition.
    pub fn holds(self, lhs: usize, rhs: usize) -> bool {
        match self {
            Cond::Eq => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::Lt => lhs < rhs,
            Cond::Ge => lhs >= rhs,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "beq",
            Cond::Ne => "bne",
            Cond::Lt => "blt",
            Cond::Ge => "bge",
        }
    }
}

/// A branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

impl Label {
    /// The label number.
    pub fn id(self) -> usize {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Runtime helper entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperKind {
    /// `monitorEnter(thread, object)`
    MonitorEnter,
    /// `monitorExit(thread, object)`
    MonitorExit,
}

impl fmt::Display for HelperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperKind::MonitorEnter => f.write_str("monitorEnter"),
            HelperKind::MonitorExit => f.write_str("monitorExit"),
        }
    }
}

/// One abstract operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Lock word address resolution
    /// Point the slot at the object's embedded lock word.
    LocateEmbedded {
        /// Byte offset into the object.
        offset: usize,
    },
    /// `dst = (object address >> alignment) & cache mask`.
    CacheIndex {
        /// Destination.
        dst: Reg,
    },
    /// Read cache entry `index`; if it does not belong to the object jump to
    /// `miss`, otherwise point the slot at the record's alternate lock word.
    CacheProbe {
        /// Register holding the index.
        index: Reg,
        /// Miss target.
        miss: Label,
    },

    // Guards
    /// Jump to `target` if the object's class has any of `flag`.
    TestClassFlag {
        /// Flags to test.
        flag: ClassFlags,
        /// Taken target.
        target: Label,
    },

    // Memory
    /// Acquire load of the slot.
    AtomicLoad {
        /// Destination.
        dst: Reg,
    },
    /// Plain load of the slot.
    PlainLoad {
        /// Destination.
        dst: Reg,
    },
    /// Atomic compare-and-swap on the slot. `dst` receives the observed
    /// value; on failure control moves to `on_fail`.
    CompareAndSwap {
        /// Expected value.
        expected: Reg,
        /// Replacement value.
        new: Reg,
        /// Observed value.
        dst: Reg,
        /// Failure target.
        on_fail: Label,
    },
    /// Plain store to the slot.
    PlainStore {
        /// Source.
        src: Reg,
    },
    /// Release fence.
    ReleaseFence,

    // Register arithmetic
    /// `dst = imm`
    MoveImm {
        /// Destination.
        dst: Reg,
        /// Value.
        imm: usize,
    },
    /// `dst = current thread identity`
    LoadThread {
        /// Destination.
        dst: Reg,
    },
    /// `dst = src + imm`
    AddImm {
        /// Destination.
        dst: Reg,
        /// Source.
        src: Reg,
        /// Value.
        imm: usize,
    },
    /// `dst = src - imm`
    SubImm {
        /// Destination.
        dst: Reg,
        /// Source.
        src: Reg,
        /// Value.
        imm: usize,
    },
    /// `dst = src & imm`
    AndImm {
        /// Destination.
        dst: Reg,
        /// Source.
        src: Reg,
        /// Value.
        imm: usize,
    },
    /// `dst = src & !imm`
    AndNotImm {
        /// Destination.
        dst: Reg,
        /// Source.
        src: Reg,
        /// Value.
        imm: usize,
    },
    /// `dst = src | imm`
    OrImm {
        /// Destination.
        dst: Reg,
        /// Source.
        src: Reg,
        /// Value.
        imm: usize,
    },

    // Control
    /// Conditional branch.
    Branch {
        /// Left operand.
        lhs: Reg,
        /// Condition.
        cond: Cond,
        /// Right operand.
        rhs: Operand,
        /// Taken target.
        target: Label,
    },
    /// Unconditional jump.
    Jump {
        /// Target.
        target: Label,
    },
    /// Hand the whole operation to the runtime helper. Terminal.
    CallHelper(HelperKind),
    /// Finish. Terminal.
    Return,
}

impl Op {
    /// Whether the op reads or writes the slot atomically.
    pub fn is_atomic(&self) -> bool {
        matches!(self, Op::AtomicLoad { .. } | Op::CompareAndSwap { .. })
    }

    /// Whether the op ends execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Op::CallHelper(_) | Op::Return)
    }

    fn labels(&self) -> Option<Label> {
        match *self {
            Op::CacheProbe { miss, .. } => Some(miss),
            Op::TestClassFlag { target, .. } => Some(target),
            Op::CompareAndSwap { on_fail, .. } => Some(on_fail),
            Op::Branch { target, .. } | Op::Jump { target } => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Op::LocateEmbedded { offset } => write!(f, "lea      slot, [obj+{}]", offset),
            Op::CacheIndex { dst } => write!(f, "cidx     {}, obj", dst),
            Op::CacheProbe { index, miss } => write!(f, "cprobe   slot, cache[{}], miss {}", index, miss),
            Op::TestClassFlag { flag, target } => {
                write!(f, "tstcls   {:#x}, {}", flag.bits(), target)
            }
            Op::AtomicLoad { dst } => write!(f, "ld.acq   {}, [slot]", dst),
            Op::PlainLoad { dst } => write!(f, "ld       {}, [slot]", dst),
            Op::CompareAndSwap {
                expected,
                new,
                dst,
                on_fail,
            } => write!(f, "cas      {}, [slot], {} -> {}, fail {}", dst, expected, new, on_fail),
            Op::PlainStore { src } => write!(f, "st       {}, [slot]", src),
            Op::ReleaseFence => f.write_str("fence.rel"),
            Op::MoveImm { dst, imm } => write!(f, "li       {}, {:#x}", dst, imm),
            Op::LoadThread { dst } => write!(f, "ldthr    {}", dst),
            Op::AddImm { dst, src, imm } => write!(f, "addi     {}, {}, {:#x}", dst, src, imm),
            Op::SubImm { dst, src, imm } => write!(f, "subi     {}, {}, {:#x}", dst, src, imm),
            Op::AndImm { dst, src, imm } => write!(f, "andi     {}, {}, {:#x}", dst, src, imm),
            Op::AndNotImm { dst, src, imm } => write!(f, "andci    {}, {}, {:#x}", dst, src, imm),
            Op::OrImm { dst, src, imm } => write!(f, "ori      {}, {}, {:#x}", dst, src, imm),
            Op::Branch {
                lhs,
                cond,
                rhs,
                target,
            } => write!(f, "{}      {}, {}, {}", cond.mnemonic(), lhs, rhs, target),
            Op::Jump { target } => write!(f, "b        {}", target),
            Op::CallHelper(kind) => write!(f, "call     {}", kind),
            Op::Return => f.write_str("ret"),
        }
    }
}

// ============================================================================
// Sequences
// ============================================================================

/// A finished, label-resolved operation sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    name: String,
    ops: Vec<Op>,
    targets: Vec<usize>,
}

impl Sequence {
    /// Descriptive name used in listings.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operations.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Position a label is bound to.
    pub fn target(&self, label: Label) -> usize {
        self.targets[label.0]
    }

    /// Count the ops matching `pred`.
    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    /// Whether any op calls `kind`.
    pub fn calls(&self, kind: HelperKind) -> bool {
        self.ops.iter().any(|op| *op == Op::CallHelper(kind))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        for (pc, op) in self.ops.iter().enumerate() {
            for (label, _) in self.targets.iter().enumerate().filter(|(_, t)| **t == pc) {
                writeln!(f, "L{}:", label)?;
            }
            writeln!(f, "  {:3}  {}", pc, op)?;
        }
        Ok(())
    }
}

/// Builds a [`Sequence`] with forward labels.
#[derive(Debug)]
pub struct SequenceBuilder {
    name: String,
    ops: Vec<Op>,
    bindings: Vec<Option<usize>>,
    error: Option<LoweringError>,
}

impl SequenceBuilder {
    /// Start a sequence.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ops: Vec::new(),
            bindings: Vec::new(),
            error: None,
        }
    }

    /// Create an unbound label.
    pub fn new_label(&mut self) -> Label {
        self.bindings.push(None);
        Label(self.bindings.len() - 1)
    }

    /// Bind `label` to the next emitted op.
    pub fn bind(&mut self, label: Label) {
        match self.bindings[label.0] {
            Some(_) if self.error.is_none() => {
                self.error = Some(LoweringError::DuplicateBinding(label.0));
            }
            Some(_) => {}
            None => self.bindings[label.0] = Some(self.ops.len()),
        }
    }

    /// Append an op.
    pub fn emit(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Resolve labels and produce the sequence.
    pub fn finish(self) -> Result<Sequence, LoweringError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        for op in &self.ops {
            if let Some(label) = op.labels() {
                match self.bindings[label.0] {
                    Some(pc) if pc < self.ops.len() => {}
                    _ => return Err(LoweringError::UnboundLabel(label.0)),
                }
            }
        }
        // Unused labels may stay unbound; point them past the end.
        let end = self.ops.len();
        let targets = self.bindings.iter().map(|b| b.unwrap_or(end)).collect();
        Ok(Sequence {
            name: self.name,
            ops: self.ops,
            targets,
        })
    }
}
