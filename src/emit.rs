//! Emission façade: drive a lowering and stream the words to a sink.

use std::io::{Seek, Write};

use tracing::debug;

use crate::error::CodegenError;
use crate::lower::Lower;
use crate::mir::Mir;

/// A source location seeding the debug writer's line program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SrcLoc {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl SrcLoc {
    /// A location at `line:column`.
    pub const fn new(line: u32, column: u32) -> SrcLoc {
        SrcLoc { line, column }
    }
}

/// Everything the debug-info writer needs about one emitted function.
///
/// The MIR is included so the writer can decode the pseudo-instruction
/// markers (`dbg_line`, `dbg_prologue_end`, `enter_frame`, ...); this
/// crate emits no DWARF bytes itself.
#[derive(Debug)]
pub struct FunctionDebugInfo<'a> {
    /// The function's MIR, with its pseudo markers intact.
    pub mir: &'a Mir,
    /// Index of the function within its module.
    pub func_index: u32,
    /// Index of the output atom the body was written into.
    pub atom_index: u32,
    /// Byte offset of the first instruction in the sink.
    pub start: u64,
    /// Byte offset one past the last instruction.
    pub end: u64,
    /// Location of the function declaration.
    pub src_loc: SrcLoc,
}

/// The external debug-info writer contract.
pub trait DebugInfoWriter {
    /// Called once per emitted function, after its body is in the sink.
    fn function(&mut self, info: FunctionDebugInfo<'_>) -> std::io::Result<()>;
}

/// Destination for debug metadata.
#[derive(Default)]
pub enum DebugOutput<'a> {
    /// Discard debug metadata.
    #[default]
    None,
    /// Forward function extents and MIR to a DWARF writer.
    Dwarf(&'a mut dyn DebugInfoWriter),
}

/// Lowers `mir` and streams the encoded words little-endian into `w`.
///
/// Relocation patching completes before the first byte is written, so
/// the sink never observes placeholder immediates. On error the sink may
/// have received leading words; callers wanting atomicity wrap the sink.
pub fn emit<W: Write + Seek>(
    mir: &Mir,
    src_loc: SrcLoc,
    func_index: u32,
    atom_index: u32,
    w: &mut W,
    debug_output: DebugOutput<'_>,
) -> Result<(), CodegenError> {
    let mut lower = Lower::new(mir);
    lower.lower_mir()?;

    let start = w.stream_position()?;
    for &word in lower.instructions() {
        w.write_all(&word.to_le_bytes())?;
    }
    let end = w.stream_position()?;
    debug!(func_index, atom_index, start, end, "emitted function body");

    if let DebugOutput::Dwarf(writer) = debug_output {
        writer.function(FunctionDebugInfo {
            mir,
            func_index,
            atom_index,
            start,
            end,
            src_loc,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::build;
    use std::io::Cursor;

    #[derive(Default)]
    struct RecordingWriter {
        calls: Vec<(u32, u32, u64, u64)>,
    }

    impl DebugInfoWriter for RecordingWriter {
        fn function(&mut self, info: FunctionDebugInfo<'_>) -> std::io::Result<()> {
            self.calls
                .push((info.func_index, info.atom_index, info.start, info.end));
            Ok(())
        }
    }

    #[test]
    fn ret_emits_little_endian_bytes() {
        let mut mir = crate::mir::Mir::new();
        mir.push(build::ret());
        let mut sink = Cursor::new(Vec::new());
        emit(&mir, SrcLoc::default(), 0, 0, &mut sink, DebugOutput::None).unwrap();
        assert_eq!(sink.into_inner(), vec![0xc0, 0x03, 0x5f, 0xd6]);
    }

    #[test]
    fn debug_writer_sees_function_extents() {
        let mut mir = crate::mir::Mir::new();
        mir.push(build::nop());
        mir.push(build::ret());

        let mut sink = Cursor::new(Vec::new());
        // Pre-existing bytes shift the start offset.
        sink.write_all(&[0u8; 12]).unwrap();

        let mut writer = RecordingWriter::default();
        emit(
            &mir,
            SrcLoc::new(4, 1),
            7,
            2,
            &mut sink,
            DebugOutput::Dwarf(&mut writer),
        )
        .unwrap();
        assert_eq!(writer.calls, vec![(7, 2, 12, 20)]);
    }

    #[test]
    fn nothing_reaches_the_sink_on_lowering_failure() {
        let mut mir = crate::mir::Mir::new();
        mir.push(build::b(crate::mir::InstIndex(42)));
        let mut sink = Cursor::new(Vec::new());
        let err = emit(&mir, SrcLoc::default(), 0, 0, &mut sink, DebugOutput::None);
        assert!(err.is_err());
        assert!(sink.into_inner().is_empty());
    }
}
