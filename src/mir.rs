//! Machine IR for one function, one step above the encoded stream.
//!
//! The producer (the type-aware lowering upstream of this crate) builds a
//! [`Mir`] record, hands it to [`crate::emit::emit`] read-only, and frees
//! it afterwards. Instructions are a `(tag, data)` pair: the tag names
//! the abstract ARM64 operation and the data variant carries exactly the
//! operand bundle that tag expects; mismatches are rejected by the
//! encoder, not representable ones by construction.
//!
//! Pseudo instructions contribute no machine words but stay addressable:
//! a branch may target a pseudo and resolves to the next real word.

use std::collections::BTreeMap;

use core::fmt;

use static_assertions::const_assert;

use crate::bits::cond::Cond;
use crate::bits::frame::{FrameAddr, FrameIndex, FrameLoc};
use crate::bits::imm::Imm;
use crate::bits::mem::Mem;
use crate::bits::reg::{Reg, SysReg};
use crate::bits::ShiftOp;
use crate::error::{CodegenError, EncodeError};

/// Index of one MIR instruction within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstIndex(pub u32);

impl InstIndex {
    /// The index as a usize, for slice access.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl From<u32> for InstIndex {
    fn from(v: u32) -> Self {
        InstIndex(v)
    }
}

/// Abstract opcode of one MIR instruction.
///
/// Immediate and register forms share a tag; the operand bundle selects
/// the encoding. `And` with [`Data::Rrr`] is the shifted-register form,
/// `And` with [`Data::RrBitmask`] the bitmask-immediate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum Tag {
    /// Add.
    Add,
    /// Add, setting flags.
    Adds,
    /// Subtract.
    Sub,
    /// Subtract, setting flags.
    Subs,
    /// Add with carry.
    Adc,
    /// Subtract with carry.
    Sbc,
    /// Multiply-add.
    Madd,
    /// Multiply-subtract.
    Msub,
    /// Multiply.
    Mul,
    /// Signed multiply high.
    Smulh,
    /// Unsigned multiply high.
    Umulh,
    /// Signed divide.
    Sdiv,
    /// Unsigned divide.
    Udiv,

    /// Bitwise and.
    And,
    /// Bitwise and, setting flags.
    Ands,
    /// Bitwise or.
    Orr,
    /// Bitwise or with complement.
    Orn,
    /// Bitwise exclusive or.
    Eor,
    /// Bitwise exclusive or with complement.
    Eon,
    /// Bit clear.
    Bic,

    /// Logical shift left; variable or immediate by operand bundle.
    Lsl,
    /// Logical shift right.
    Lsr,
    /// Arithmetic shift right.
    Asr,
    /// Rotate right.
    Ror,

    /// Count leading zeros.
    Clz,
    /// Reverse bit order.
    Rbit,
    /// Reverse byte order.
    Rev,

    /// Move wide with zero; the immediate is the already-shifted pattern.
    Movz,
    /// Move wide with not.
    Movn,
    /// Move wide with keep.
    Movk,
    /// Register move; lowers to ORR, or to ADD #0 when SP is involved.
    MovReg,

    /// Load register.
    Ldr,
    /// Load byte, zero-extending.
    Ldrb,
    /// Load halfword, zero-extending.
    Ldrh,
    /// Load byte, sign-extending to 64 bits.
    Ldrsb,
    /// Load halfword, sign-extending to 64 bits.
    Ldrsh,
    /// Load word, sign-extending to 64 bits.
    Ldrsw,
    /// Store register.
    Str,
    /// Store byte.
    Strb,
    /// Store halfword.
    Strh,
    /// Load register pair.
    Ldp,
    /// Store register pair.
    Stp,

    /// Unconditional branch.
    B,
    /// Branch with link.
    Bl,
    /// Branch to register.
    Br,
    /// Branch with link to register.
    Blr,
    /// Return.
    Ret,
    /// Conditional branch.
    BCond,
    /// Compare and branch if zero.
    Cbz,
    /// Compare and branch if nonzero.
    Cbnz,
    /// Test bit and branch if zero.
    Tbz,
    /// Test bit and branch if nonzero.
    Tbnz,

    /// Compare; SUBS discarding the result.
    Cmp,
    /// Compare negative.
    Cmn,
    /// Test bits; ANDS discarding the result.
    Tst,

    /// Conditional select.
    Csel,
    /// Conditional select increment.
    Csinc,
    /// Conditional select invert.
    Csinv,
    /// Conditional select negate.
    Csneg,
    /// Conditional set.
    Cset,
    /// Conditional increment.
    Cinc,

    /// Unsigned bitfield extract: `(lsb, width)` from the source.
    Ubfm,
    /// Signed bitfield extract.
    Sbfm,
    /// Bitfield insert: `width` low bits of the source at `lsb`.
    Bfm,
    /// Sign-extend byte.
    Sxtb,
    /// Sign-extend halfword.
    Sxth,
    /// Sign-extend word.
    Sxtw,
    /// Zero-extend byte.
    Uxtb,
    /// Zero-extend halfword.
    Uxth,

    /// No operation.
    Nop,
    /// Breakpoint.
    Brk,
    /// Supervisor call.
    Svc,
    /// Read system register.
    Mrs,
    /// Write system register.
    Msr,
    /// Data memory barrier (full system).
    Dmb,
    /// Data synchronization barrier (full system).
    Dsb,
    /// Instruction synchronization barrier.
    Isb,

    /// Load exclusive.
    Ldxr,
    /// Load-acquire exclusive.
    Ldaxr,
    /// Load-acquire.
    Ldar,
    /// Store exclusive; status, source, base.
    Stxr,
    /// Store-release exclusive.
    Stlxr,
    /// Store-release.
    Stlr,

    /// Floating-point add.
    Fadd,
    /// Floating-point subtract.
    Fsub,
    /// Floating-point multiply.
    Fmul,
    /// Floating-point divide.
    Fdiv,
    /// Floating-point compare.
    Fcmp,
    /// Floating-point move, including moves to and from the integer file.
    Fmov,
    /// Floating-point absolute value.
    Fabs,
    /// Floating-point negate.
    Fneg,
    /// Floating-point square root.
    Fsqrt,
    /// Floating-point precision conversion.
    Fcvt,
    /// Signed integer to floating-point.
    Scvtf,
    /// Unsigned integer to floating-point.
    Ucvtf,
    /// Floating-point to signed integer, rounding toward zero.
    Fcvtzs,
    /// Floating-point to unsigned integer, rounding toward zero.
    Fcvtzu,

    /// PC-relative address of a nearby byte offset.
    Adr,
    /// PC-relative address of a 4 KiB page.
    Adrp,

    /// A raw 32-bit word taken verbatim.
    Raw,

    /// Source line marker.
    PseudoDbgLine,
    /// End of the function prologue.
    PseudoDbgPrologueEnd,
    /// Start of the function epilogue.
    PseudoDbgEpilogueBegin,
    /// Lexical block entry.
    PseudoDbgEnterBlock,
    /// Lexical block exit.
    PseudoDbgLeaveBlock,
    /// Frame setup anchor for CFI.
    PseudoEnterFrame,
    /// Frame teardown anchor for CFI.
    PseudoExitFrame,
    /// A value died; allocation hint.
    PseudoDead,
    /// A register was spilled; allocation hint.
    PseudoSpill,
    /// A register was reloaded; allocation hint.
    PseudoReload,
}

impl Tag {
    /// Whether this tag contributes no machine word.
    pub const fn is_pseudo(self) -> bool {
        matches!(
            self,
            Tag::PseudoDbgLine
                | Tag::PseudoDbgPrologueEnd
                | Tag::PseudoDbgEpilogueBegin
                | Tag::PseudoDbgEnterBlock
                | Tag::PseudoDbgLeaveBlock
                | Tag::PseudoEnterFrame
                | Tag::PseudoExitFrame
                | Tag::PseudoDead
                | Tag::PseudoSpill
                | Tag::PseudoReload
        )
    }

    /// The assembler mnemonic.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Tag::Add => "add",
            Tag::Adds => "adds",
            Tag::Sub => "sub",
            Tag::Subs => "subs",
            Tag::Adc => "adc",
            Tag::Sbc => "sbc",
            Tag::Madd => "madd",
            Tag::Msub => "msub",
            Tag::Mul => "mul",
            Tag::Smulh => "smulh",
            Tag::Umulh => "umulh",
            Tag::Sdiv => "sdiv",
            Tag::Udiv => "udiv",
            Tag::And => "and",
            Tag::Ands => "ands",
            Tag::Orr => "orr",
            Tag::Orn => "orn",
            Tag::Eor => "eor",
            Tag::Eon => "eon",
            Tag::Bic => "bic",
            Tag::Lsl => "lsl",
            Tag::Lsr => "lsr",
            Tag::Asr => "asr",
            Tag::Ror => "ror",
            Tag::Clz => "clz",
            Tag::Rbit => "rbit",
            Tag::Rev => "rev",
            Tag::Movz => "movz",
            Tag::Movn => "movn",
            Tag::Movk => "movk",
            Tag::MovReg => "mov",
            Tag::Ldr => "ldr",
            Tag::Ldrb => "ldrb",
            Tag::Ldrh => "ldrh",
            Tag::Ldrsb => "ldrsb",
            Tag::Ldrsh => "ldrsh",
            Tag::Ldrsw => "ldrsw",
            Tag::Str => "str",
            Tag::Strb => "strb",
            Tag::Strh => "strh",
            Tag::Ldp => "ldp",
            Tag::Stp => "stp",
            Tag::B => "b",
            Tag::Bl => "bl",
            Tag::Br => "br",
            Tag::Blr => "blr",
            Tag::Ret => "ret",
            Tag::BCond => "b.",
            Tag::Cbz => "cbz",
            Tag::Cbnz => "cbnz",
            Tag::Tbz => "tbz",
            Tag::Tbnz => "tbnz",
            Tag::Cmp => "cmp",
            Tag::Cmn => "cmn",
            Tag::Tst => "tst",
            Tag::Csel => "csel",
            Tag::Csinc => "csinc",
            Tag::Csinv => "csinv",
            Tag::Csneg => "csneg",
            Tag::Cset => "cset",
            Tag::Cinc => "cinc",
            Tag::Ubfm => "ubfx",
            Tag::Sbfm => "sbfx",
            Tag::Bfm => "bfi",
            Tag::Sxtb => "sxtb",
            Tag::Sxth => "sxth",
            Tag::Sxtw => "sxtw",
            Tag::Uxtb => "uxtb",
            Tag::Uxth => "uxth",
            Tag::Nop => "nop",
            Tag::Brk => "brk",
            Tag::Svc => "svc",
            Tag::Mrs => "mrs",
            Tag::Msr => "msr",
            Tag::Dmb => "dmb",
            Tag::Dsb => "dsb",
            Tag::Isb => "isb",
            Tag::Ldxr => "ldxr",
            Tag::Ldaxr => "ldaxr",
            Tag::Ldar => "ldar",
            Tag::Stxr => "stxr",
            Tag::Stlxr => "stlxr",
            Tag::Stlr => "stlr",
            Tag::Fadd => "fadd",
            Tag::Fsub => "fsub",
            Tag::Fmul => "fmul",
            Tag::Fdiv => "fdiv",
            Tag::Fcmp => "fcmp",
            Tag::Fmov => "fmov",
            Tag::Fabs => "fabs",
            Tag::Fneg => "fneg",
            Tag::Fsqrt => "fsqrt",
            Tag::Fcvt => "fcvt",
            Tag::Scvtf => "scvtf",
            Tag::Ucvtf => "ucvtf",
            Tag::Fcvtzs => "fcvtzs",
            Tag::Fcvtzu => "fcvtzu",
            Tag::Adr => "adr",
            Tag::Adrp => "adrp",
            Tag::Raw => ".inst",
            Tag::PseudoDbgLine => "dbg_line",
            Tag::PseudoDbgPrologueEnd => "dbg_prologue_end",
            Tag::PseudoDbgEpilogueBegin => "dbg_epilogue_begin",
            Tag::PseudoDbgEnterBlock => "dbg_enter_block",
            Tag::PseudoDbgLeaveBlock => "dbg_leave_block",
            Tag::PseudoEnterFrame => "enter_frame",
            Tag::PseudoExitFrame => "exit_frame",
            Tag::PseudoDead => "dead",
            Tag::PseudoSpill => "spill",
            Tag::PseudoReload => "reload",
        }
    }
}

/// Operand bundle of one MIR instruction; one variant per layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum Data {
    /// No operands.
    None,
    /// One register. For RET/BR/BLR this is the branch target register.
    R {
        /// The register.
        rd: Reg,
    },
    /// Two registers. Compare tags read them as `(rn, rm)`.
    Rr {
        /// Destination, or left source for compare tags.
        rd: Reg,
        /// Source.
        rn: Reg,
    },
    /// Three registers.
    Rrr {
        /// Destination.
        rd: Reg,
        /// Left source.
        rn: Reg,
        /// Right source.
        rm: Reg,
    },
    /// Four registers.
    Rrrr {
        /// Destination.
        rd: Reg,
        /// Left source.
        rn: Reg,
        /// Right source.
        rm: Reg,
        /// Accumulator.
        ra: Reg,
    },
    /// Register and immediate.
    Ri {
        /// Destination.
        rd: Reg,
        /// The immediate.
        imm: Imm,
    },
    /// Two registers and an immediate.
    Rri {
        /// Destination.
        rd: Reg,
        /// Source.
        rn: Reg,
        /// The immediate.
        imm: Imm,
    },
    /// Shifted-register form.
    RrrShift {
        /// Destination.
        rd: Reg,
        /// Left source.
        rn: Reg,
        /// Shifted right source.
        rm: Reg,
        /// Shift operator.
        shift: ShiftOp,
        /// Shift amount.
        amount: u8,
    },
    /// Logical operation with a bitmask immediate.
    RrBitmask {
        /// Destination.
        rd: Reg,
        /// Source.
        rn: Reg,
        /// The immediate value; must be a valid ARM64 bitmask pattern.
        imm: u64,
    },
    /// Bitfield operation on `(lsb, width)`.
    RrLsbWidth {
        /// Destination.
        rd: Reg,
        /// Source.
        rn: Reg,
        /// Lowest bit of the field.
        lsb: u8,
        /// Width of the field in bits.
        width: u8,
    },
    /// Load: register from memory.
    Rm {
        /// Destination register.
        rt: Reg,
        /// Source operand.
        mem: Mem,
    },
    /// Store: register to memory.
    Mr {
        /// Destination operand.
        mem: Mem,
        /// Source register.
        rt: Reg,
    },
    /// Load pair.
    Rrm {
        /// First destination.
        rt: Reg,
        /// Second destination.
        rt2: Reg,
        /// Source operand.
        mem: Mem,
    },
    /// Store pair.
    Mrr {
        /// Destination operand.
        mem: Mem,
        /// First source.
        rt: Reg,
        /// Second source.
        rt2: Reg,
    },
    /// Three registers and a condition.
    Rrrc {
        /// Destination.
        rd: Reg,
        /// Selected when the condition holds.
        rn: Reg,
        /// Selected otherwise.
        rm: Reg,
        /// The condition.
        cond: Cond,
    },
    /// Two registers and a condition.
    Rrc {
        /// Destination.
        rd: Reg,
        /// Source.
        rn: Reg,
        /// The condition.
        cond: Cond,
    },
    /// One register and a condition.
    Rc {
        /// Destination.
        rd: Reg,
        /// The condition.
        cond: Cond,
    },
    /// CBZ/CBNZ family: register, canonical condition, and a target that
    /// may still be unmaterialized while MIR is under construction.
    /// Lowering an instruction whose target is `None` is an error.
    RegCond {
        /// The tested register.
        rn: Reg,
        /// `Eq` for CBZ, `Ne` for CBNZ.
        cond: Cond,
        /// The branch target.
        target: Option<InstIndex>,
    },
    /// Branch to another MIR instruction.
    Rel {
        /// The branch target.
        target: InstIndex,
    },
    /// Conditional branch to another MIR instruction.
    CondRel {
        /// The branch condition.
        cond: Cond,
        /// The branch target.
        target: InstIndex,
    },
    /// Bit-test branch.
    RBitRel {
        /// The tested register.
        rn: Reg,
        /// The tested bit, `0..=63`.
        bit: u8,
        /// The branch target.
        target: InstIndex,
    },
    /// Register and system register.
    RSys {
        /// The general-purpose register.
        rt: Reg,
        /// The system register.
        sys: SysReg,
    },
    /// A bare 32-bit payload: RAW words, BRK/SVC immediates.
    Imm32 {
        /// The payload.
        imm: u32,
    },
    /// Source location.
    DbgLine {
        /// 1-based line.
        line: u32,
        /// 1-based column.
        column: u32,
    },
    /// The register whose value died.
    DeadReg {
        /// The register.
        reg: Reg,
    },
    /// Spill of a register to memory.
    Spill {
        /// The spilled register.
        reg: Reg,
        /// The spill slot.
        mem: Mem,
    },
    /// Reload of a register from memory.
    Reload {
        /// The reload slot.
        mem: Mem,
        /// The reloaded register.
        reg: Reg,
    },
}

/// One MIR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Inst {
    /// The abstract opcode.
    pub tag: Tag,
    /// The operand bundle.
    pub data: Data,
}

// MIR is stored densely; keep instructions at a couple of words.
const_assert!(core::mem::size_of::<Inst>() <= 40);

impl Inst {
    /// A new instruction from its parts.
    pub const fn new(tag: Tag, data: Data) -> Inst {
        Inst { tag, data }
    }

    /// Whether the instruction contributes no machine word.
    pub const fn is_pseudo(&self) -> bool {
        self.tag.is_pseudo()
    }

    /// The intra-function branch target, if this instruction has one.
    /// `Some(None)` means the target slot exists but is unmaterialized.
    pub const fn branch_target(&self) -> Option<Option<InstIndex>> {
        match self.data {
            Data::Rel { target } | Data::CondRel { target, .. } | Data::RBitRel { target, .. } => {
                Some(Some(target))
            }
            Data::RegCond { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.tag.mnemonic();
        match self.data {
            Data::None => f.write_str(m),
            Data::R { rd } => write!(f, "{m} {rd}"),
            Data::Rr { rd, rn } => write!(f, "{m} {rd}, {rn}"),
            Data::Rrr { rd, rn, rm } => write!(f, "{m} {rd}, {rn}, {rm}"),
            Data::Rrrr { rd, rn, rm, ra } => write!(f, "{m} {rd}, {rn}, {rm}, {ra}"),
            Data::Ri { rd, imm } => write!(f, "{m} {rd}, {imm}"),
            Data::Rri { rd, rn, imm } => write!(f, "{m} {rd}, {rn}, {imm}"),
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            } => write!(f, "{m} {rd}, {rn}, {rm}, {shift} #{amount}"),
            Data::RrBitmask { rd, rn, imm } => write!(f, "{m} {rd}, {rn}, #{imm:#x}"),
            Data::RrLsbWidth { rd, rn, lsb, width } => {
                write!(f, "{m} {rd}, {rn}, #{lsb}, #{width}")
            }
            Data::Rm { rt, mem } => write!(f, "{m} {rt}, {mem}"),
            Data::Mr { mem, rt } => write!(f, "{m} {rt}, {mem}"),
            Data::Rrm { rt, rt2, mem } => write!(f, "{m} {rt}, {rt2}, {mem}"),
            Data::Mrr { mem, rt, rt2 } => write!(f, "{m} {rt}, {rt2}, {mem}"),
            Data::Rrrc { rd, rn, rm, cond } => write!(f, "{m} {rd}, {rn}, {rm}, {cond}"),
            Data::Rrc { rd, rn, cond } => write!(f, "{m} {rd}, {rn}, {cond}"),
            Data::Rc { rd, cond } => write!(f, "{m} {rd}, {cond}"),
            Data::RegCond { rn, target, .. } => match target {
                Some(t) => write!(f, "{m} {rn}, L{}", t.0),
                None => write!(f, "{m} {rn}, ?"),
            },
            Data::Rel { target } => write!(f, "{m} L{}", target.0),
            Data::CondRel { cond, target } => write!(f, "{m}{cond} L{}", target.0),
            Data::RBitRel { rn, bit, target } => write!(f, "{m} {rn}, #{bit}, L{}", target.0),
            Data::RSys { rt, sys } => match self.tag {
                Tag::Msr => write!(f, "{m} {sys}, {rt}"),
                _ => write!(f, "{m} {rt}, {sys}"),
            },
            Data::Imm32 { imm } => write!(f, "{m} {imm:#x}"),
            Data::DbgLine { line, column } => write!(f, "{m} {line}:{column}"),
            Data::DeadReg { reg } => write!(f, "{m} {reg}"),
            Data::Spill { reg, mem } => write!(f, "{m} {reg}, {mem}"),
            Data::Reload { mem, reg } => write!(f, "{m} {reg}, {mem}"),
        }
    }
}

/// A named local variable, for the debug-info writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Local {
    /// Byte offset of the NUL-terminated name in `string_bytes`.
    pub name: u32,
    /// Producer-defined type id.
    pub ty: u32,
}

/// The machine IR of one function.
///
/// All interior arrays are borrowed for the duration of an emit call;
/// the producer owns and frees the record.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mir {
    /// The instruction stream.
    pub instructions: Vec<Inst>,
    /// Out-of-line payloads referenced by index.
    pub extra: Vec<u32>,
    /// NUL-terminated string storage for names.
    pub string_bytes: Vec<u8>,
    /// Named locals.
    pub locals: Vec<Local>,
    /// Generic index table for producer bookkeeping.
    pub table: Vec<u32>,
    /// Placement of each frame region used by the function.
    pub frame_locs: BTreeMap<FrameIndex, FrameLoc>,
}

impl Mir {
    /// An empty record.
    pub fn new() -> Mir {
        Mir::default()
    }

    /// Number of instructions, pseudos included.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the record has no instructions.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Number of instructions that produce a machine word.
    pub fn real_len(&self) -> usize {
        self.instructions.iter().filter(|i| !i.is_pseudo()).count()
    }

    /// The instruction at `index`, if in range.
    pub fn inst(&self, index: InstIndex) -> Option<&Inst> {
        self.instructions.get(index.index())
    }

    /// Appends an instruction and returns its index.
    pub fn push(&mut self, inst: Inst) -> InstIndex {
        let index = InstIndex(self.instructions.len() as u32);
        self.instructions.push(inst);
        index
    }

    /// Interns a name and returns its byte offset.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        let offset = self.string_bytes.len() as u32;
        self.string_bytes.extend_from_slice(s.as_bytes());
        self.string_bytes.push(0);
        offset
    }

    /// The name starting at byte `offset`, up to its NUL terminator.
    pub fn string_at(&self, offset: u32) -> Option<&str> {
        let bytes = self.string_bytes.get(offset as usize..)?;
        let end = bytes.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&bytes[..end]).ok()
    }

    /// Records the placement of a frame region.
    pub fn set_frame_loc(&mut self, index: FrameIndex, loc: FrameLoc) {
        self.frame_locs.insert(index, loc);
    }

    /// The placement of a frame region.
    pub fn frame_loc(&self, index: FrameIndex) -> Option<FrameLoc> {
        self.frame_locs.get(&index).copied()
    }

    /// Folds a frame address into a concrete memory operand off `base`.
    ///
    /// The region must have a recorded placement; the folded offset must
    /// not overflow.
    pub fn frame_mem(&self, addr: FrameAddr, base: Reg) -> Result<Mem, EncodeError> {
        let loc = self
            .frame_loc(addr.index)
            .ok_or(EncodeError::InvalidOperands)?;
        let offset = loc
            .offset
            .checked_add(addr.offset)
            .ok_or(EncodeError::Overflow)?;
        Ok(Mem::offset(base, offset))
    }

    /// Checks the producer-side invariants: every branch target is in
    /// range and materialized, and frame alignments are powers of two.
    pub fn validate(&self) -> Result<(), CodegenError> {
        for (i, inst) in self.instructions.iter().enumerate() {
            let index = InstIndex(i as u32);
            match inst.branch_target() {
                Some(Some(target)) if target.index() >= self.len() => {
                    return Err(CodegenError::TargetOutOfBounds {
                        inst: index,
                        target,
                    });
                }
                Some(None) => return Err(CodegenError::UnresolvedBranchTarget(index)),
                _ => {}
            }
        }
        for (&index, loc) in &self.frame_locs {
            if !loc.align.is_power_of_two() {
                return Err(CodegenError::MisalignedFrameLoc(index));
            }
        }
        Ok(())
    }
}

/// The MOVZ/MOVK sequence materializing a 64-bit constant into `rd`.
///
/// Zero-valued 16-bit chunks are skipped; the all-zero constant becomes
/// a single `movz rd, #0`.
pub fn wide_moves(rd: Reg, value: u64) -> Vec<Inst> {
    let mut seq = Vec::with_capacity(4);
    for hw in 0..4 {
        let chunk = (value >> (hw * 16)) & 0xffff;
        if chunk == 0 {
            continue;
        }
        let tag = if seq.is_empty() { Tag::Movz } else { Tag::Movk };
        seq.push(Inst::new(
            tag,
            Data::Ri {
                rd,
                imm: Imm::Unsigned(chunk << (hw * 16)),
            },
        ));
    }
    if seq.is_empty() {
        seq.push(Inst::new(
            Tag::Movz,
            Data::Ri {
                rd,
                imm: Imm::Unsigned(0),
            },
        ));
    }
    seq
}

pub mod build {
    //! Short-hand constructors for common instructions.

    use super::*;

    /// `nop`
    pub const fn nop() -> Inst {
        Inst::new(Tag::Nop, Data::None)
    }

    /// `ret x30`
    pub const fn ret() -> Inst {
        Inst::new(Tag::Ret, Data::R { rd: Reg::LR })
    }

    /// `add rd, rn, rm`
    pub const fn add(rd: Reg, rn: Reg, rm: Reg) -> Inst {
        Inst::new(Tag::Add, Data::Rrr { rd, rn, rm })
    }

    /// `add rd, rn, #imm`
    pub const fn add_imm(rd: Reg, rn: Reg, imm: u64) -> Inst {
        Inst::new(
            Tag::Add,
            Data::Rri {
                rd,
                rn,
                imm: Imm::Unsigned(imm),
            },
        )
    }

    /// `sub rd, rn, rm`
    pub const fn sub(rd: Reg, rn: Reg, rm: Reg) -> Inst {
        Inst::new(Tag::Sub, Data::Rrr { rd, rn, rm })
    }

    /// `sub rd, rn, #imm`
    pub const fn sub_imm(rd: Reg, rn: Reg, imm: u64) -> Inst {
        Inst::new(
            Tag::Sub,
            Data::Rri {
                rd,
                rn,
                imm: Imm::Unsigned(imm),
            },
        )
    }

    /// `mov rd, rn`
    pub const fn mov(rd: Reg, rn: Reg) -> Inst {
        Inst::new(Tag::MovReg, Data::Rr { rd, rn })
    }

    /// `movz rd, #imm`
    pub const fn movz(rd: Reg, imm: u64) -> Inst {
        Inst::new(
            Tag::Movz,
            Data::Ri {
                rd,
                imm: Imm::Unsigned(imm),
            },
        )
    }

    /// `cmp rn, rm`
    pub const fn cmp(rn: Reg, rm: Reg) -> Inst {
        Inst::new(Tag::Cmp, Data::Rr { rd: rn, rn: rm })
    }

    /// `ldr rt, mem`
    pub const fn ldr(rt: Reg, mem: Mem) -> Inst {
        Inst::new(Tag::Ldr, Data::Rm { rt, mem })
    }

    /// `str rt, mem`
    pub const fn str(rt: Reg, mem: Mem) -> Inst {
        Inst::new(Tag::Str, Data::Mr { mem, rt })
    }

    /// `ldp rt, rt2, mem`
    pub const fn ldp(rt: Reg, rt2: Reg, mem: Mem) -> Inst {
        Inst::new(Tag::Ldp, Data::Rrm { rt, rt2, mem })
    }

    /// `stp rt, rt2, mem`
    pub const fn stp(rt: Reg, rt2: Reg, mem: Mem) -> Inst {
        Inst::new(Tag::Stp, Data::Mrr { mem, rt, rt2 })
    }

    /// `b target`
    pub const fn b(target: InstIndex) -> Inst {
        Inst::new(Tag::B, Data::Rel { target })
    }

    /// `bl target`
    pub const fn bl(target: InstIndex) -> Inst {
        Inst::new(Tag::Bl, Data::Rel { target })
    }

    /// `b.cond target`
    pub const fn b_cond(cond: Cond, target: InstIndex) -> Inst {
        Inst::new(Tag::BCond, Data::CondRel { cond, target })
    }

    /// `cbz rn, target`
    pub const fn cbz(rn: Reg, target: InstIndex) -> Inst {
        Inst::new(
            Tag::Cbz,
            Data::RegCond {
                rn,
                cond: Cond::Eq,
                target: Some(target),
            },
        )
    }

    /// `cbnz rn, target`
    pub const fn cbnz(rn: Reg, target: InstIndex) -> Inst {
        Inst::new(
            Tag::Cbnz,
            Data::RegCond {
                rn,
                cond: Cond::Ne,
                target: Some(target),
            },
        )
    }

    /// `tbz rn, #bit, target`
    pub const fn tbz(rn: Reg, bit: u8, target: InstIndex) -> Inst {
        Inst::new(Tag::Tbz, Data::RBitRel { rn, bit, target })
    }

    /// `tbnz rn, #bit, target`
    pub const fn tbnz(rn: Reg, bit: u8, target: InstIndex) -> Inst {
        Inst::new(Tag::Tbnz, Data::RBitRel { rn, bit, target })
    }

    /// A verbatim 32-bit word.
    pub const fn raw(word: u32) -> Inst {
        Inst::new(Tag::Raw, Data::Imm32 { imm: word })
    }

    /// `dbg_line line:column`
    pub const fn dbg_line(line: u32, column: u32) -> Inst {
        Inst::new(Tag::PseudoDbgLine, Data::DbgLine { line, column })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_len_skips_pseudos() {
        let mut mir = Mir::new();
        mir.push(build::add(Reg::x(0), Reg::x(1), Reg::x(2)));
        mir.push(build::dbg_line(10, 4));
        mir.push(build::ret());
        assert_eq!(mir.len(), 3);
        assert_eq!(mir.real_len(), 2);
    }

    #[test]
    fn validate_rejects_out_of_bounds_targets() {
        let mut mir = Mir::new();
        mir.push(build::b(InstIndex(7)));
        assert!(matches!(
            mir.validate(),
            Err(CodegenError::TargetOutOfBounds { .. })
        ));
    }

    #[test]
    fn validate_rejects_unmaterialized_cbz() {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::Cbz,
            Data::RegCond {
                rn: Reg::x(0),
                cond: Cond::Eq,
                target: None,
            },
        ));
        mir.push(build::ret());
        assert!(matches!(
            mir.validate(),
            Err(CodegenError::UnresolvedBranchTarget(InstIndex(0)))
        ));
    }

    #[test]
    fn validate_rejects_bad_alignment() {
        let mut mir = Mir::new();
        mir.push(build::ret());
        mir.set_frame_loc(FrameIndex::StackFrame, FrameLoc::new(0, 24, 12));
        assert!(matches!(
            mir.validate(),
            Err(CodegenError::MisalignedFrameLoc(FrameIndex::StackFrame))
        ));
    }

    #[test]
    fn frame_addresses_fold_into_memory_operands() {
        let mut mir = Mir::new();
        mir.set_frame_loc(FrameIndex::StackFrame, FrameLoc::new(-32, 32, 16));
        let mem = mir
            .frame_mem(FrameAddr::new(FrameIndex::StackFrame, 8), Reg::FP)
            .unwrap();
        assert_eq!(mem, Mem::offset(Reg::FP, -24));

        assert_eq!(
            mir.frame_mem(FrameAddr::new(FrameIndex::CallFrame, 0), Reg::Sp),
            Err(EncodeError::InvalidOperands)
        );
        mir.set_frame_loc(FrameIndex::CallFrame, FrameLoc::new(i32::MAX, 8, 8));
        assert_eq!(
            mir.frame_mem(FrameAddr::new(FrameIndex::CallFrame, 1), Reg::Sp),
            Err(EncodeError::Overflow)
        );
    }

    #[test]
    fn string_interning_round_trips() {
        let mut mir = Mir::new();
        let a = mir.intern_string("count");
        let b = mir.intern_string("total");
        assert_eq!(mir.string_at(a), Some("count"));
        assert_eq!(mir.string_at(b), Some("total"));
    }

    #[test]
    fn wide_moves_skips_zero_chunks() {
        let seq = wide_moves(Reg::x(5), 0x1234_0000_5678);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].tag, Tag::Movz);
        assert_eq!(seq[1].tag, Tag::Movk);

        let zero = wide_moves(Reg::x(5), 0);
        assert_eq!(zero.len(), 1);
        assert_eq!(zero[0].tag, Tag::Movz);
    }

    #[test]
    fn display_reads_as_assembly() {
        assert_eq!(
            build::add(Reg::x(0), Reg::x(1), Reg::x(2)).to_string(),
            "add x0, x1, x2"
        );
        assert_eq!(
            build::b_cond(Cond::Eq, InstIndex(3)).to_string(),
            "b.eq L3"
        );
        assert_eq!(build::ret().to_string(), "ret x30");
    }
}
