//! Code generation error implementation.

use std::io;

use thiserror::Error;

use crate::bits::frame::FrameIndex;
use crate::bits::reg::RegClass;
use crate::lower::RelocKind;
use crate::mir::InstIndex;

/// Errors produced while encoding a single MIR instruction into its
/// 32-bit machine word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// An immediate is out of range for the selected instruction form.
    #[error("immediate out of range for the instruction form")]
    InvalidImmediate,
    /// The operand bundle does not match the opcode.
    #[error("operand layout inconsistent with the opcode")]
    InvalidOperands,
    /// A register of the wrong class, width, or a disallowed special
    /// register (e.g. SP where only ZR encodes) was supplied.
    #[error("register class or width not permitted by the opcode")]
    InvalidRegister,
    /// The MIR tag is recognized but no encoding rule exists for it yet.
    #[error("no encoding rule for this instruction")]
    UnimplementedInstruction,
    /// A pseudo instruction reached the encoder; callers must filter
    /// pseudos before asking for a machine word.
    #[error("pseudo instruction has no machine encoding")]
    PseudoInstruction,
    /// Arithmetic on a folded offset overflowed.
    #[error("offset arithmetic overflowed")]
    Overflow,
}

/// Errors that abort a whole lowering or emission.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodegenError {
    /// Encoding one instruction failed.
    #[error("encoding of MIR instruction {index} failed: {source}")]
    Encode {
        /// The MIR instruction that failed to encode.
        index: InstIndex,
        /// The underlying encoder error.
        source: EncodeError,
    },
    /// A branch names a target that was never assigned a position, or a
    /// CBZ-family instruction was lowered with its target still
    /// unmaterialized.
    #[error("branch target {0} has no resolved position")]
    UnresolvedBranchTarget(InstIndex),
    /// A branch instruction names an MIR index outside the function.
    #[error("MIR instruction {inst} targets out-of-bounds index {target}")]
    TargetOutOfBounds {
        /// The branching instruction.
        inst: InstIndex,
        /// The out-of-bounds target it names.
        target: InstIndex,
    },
    /// A branch delta exceeds the immediate width of its relocation kind.
    #[error("branch offset {delta} does not fit a {}-bit branch immediate", .kind.bits())]
    BranchOutOfRange {
        /// The relocation kind whose field overflowed.
        kind: RelocKind,
        /// The offending delta, in instructions.
        delta: i64,
    },
    /// A relocation kind reserved for the object writer was applied
    /// inside a function body.
    #[error("relocation kind {0:?} is reserved for the object writer")]
    ReservedRelocation(RelocKind),
    /// A frame location table entry violates its invariants.
    #[error("frame location for {0} has a non-power-of-two alignment")]
    MisalignedFrameLoc(FrameIndex),
    /// Writing to the byte sink failed.
    #[error("writing to the code sink failed: {0}")]
    Io(#[from] io::Error),
}

impl CodegenError {
    pub(crate) fn encode(index: InstIndex, source: EncodeError) -> Self {
        Self::Encode { index, source }
    }
}

/// The register manager exhausted the allocatable set of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no free {0:?} register available")]
pub struct OutOfRegisters(pub RegClass);
