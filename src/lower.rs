//! Lowering pass pipeline: positions, encoding, relocation, patching.
//!
//! The encoder cannot know branch deltas before positions are fixed, and
//! positions depend on which MIR entries are pseudo. The pipeline keeps
//! the encoder pure: pass one assigns a word position to every MIR index,
//! pass two encodes with placeholder branch immediates and collects a
//! relocation per late-resolved branch, pass three patches the real
//! immediates in. No word leaves a [`Lower`] before patching is complete.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::encoder::encode;
use crate::error::{CodegenError, EncodeError};
use crate::mir::{Data, InstIndex, Mir, Tag};

/// Immediate width class of a deferred branch patch.
///
/// The first four kinds are intra-function and patched by [`Lower`];
/// the rest are reserved for the object writer and applying one here is
/// an error until PIC support is wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum RelocKind {
    /// 26-bit branch immediate (B, BL).
    Branch26,
    /// 19-bit conditional branch immediate (B.cond).
    Branch19,
    /// 19-bit compare-and-branch immediate (CBZ, CBNZ).
    Cbz19,
    /// 14-bit test-and-branch immediate (TBZ, TBNZ).
    Tbz14,
    /// ADRP page relocation; reserved.
    AdrpPage,
    /// ADD page-offset relocation; reserved.
    AddPageOff,
    /// 19-bit load-literal relocation; reserved.
    Literal19,
}

impl RelocKind {
    /// Width of the immediate field in bits.
    pub const fn bits(self) -> u32 {
        match self {
            RelocKind::Branch26 => 26,
            RelocKind::Branch19 | RelocKind::Cbz19 | RelocKind::Literal19 => 19,
            RelocKind::Tbz14 => 14,
            RelocKind::AdrpPage | RelocKind::AddPageOff => 21,
        }
    }

    /// Whether the kind is resolved inside the function body.
    pub const fn is_intra_function(self) -> bool {
        matches!(
            self,
            RelocKind::Branch26 | RelocKind::Branch19 | RelocKind::Cbz19 | RelocKind::Tbz14
        )
    }

    /// Bits of the word preserved by a patch of this kind.
    const fn keep_mask(self) -> u32 {
        match self {
            RelocKind::Branch26 => 0xfc00_0000,
            RelocKind::Branch19 | RelocKind::Cbz19 => 0xff00_001f,
            RelocKind::Tbz14 => 0xfff8_001f,
            // Reserved kinds are never patched here.
            RelocKind::AdrpPage | RelocKind::AddPageOff | RelocKind::Literal19 => 0,
        }
    }

    /// The immediate field for `delta`, shifted into position.
    const fn field(self, delta: i64) -> u32 {
        match self {
            RelocKind::Branch26 => (delta as u32) & 0x03ff_ffff,
            RelocKind::Branch19 | RelocKind::Cbz19 => ((delta as u32) & 0x7ffff) << 5,
            RelocKind::Tbz14 => ((delta as u32) & 0x3fff) << 5,
            RelocKind::AdrpPage | RelocKind::AddPageOff | RelocKind::Literal19 => 0,
        }
    }
}

/// A deferred patch of one branch immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reloc {
    /// Index of the word to patch, in instructions.
    pub source: u32,
    /// The targeted MIR instruction.
    pub target: InstIndex,
    /// Immediate width class.
    pub kind: RelocKind,
}

/// One lowering of one function's MIR.
///
/// Buffers are owned by the value and released when it drops; an
/// early-exit error cannot leak them.
#[derive(Debug)]
pub struct Lower<'a> {
    mir: &'a Mir,
    instructions: Vec<u32>,
    relocations: Vec<Reloc>,
    branch_targets: HashMap<InstIndex, u32>,
}

impl<'a> Lower<'a> {
    /// A lowering over `mir`. Buffers are reserved up front from the
    /// instruction count.
    pub fn new(mir: &'a Mir) -> Lower<'a> {
        Lower {
            mir,
            instructions: Vec::with_capacity(mir.len()),
            relocations: Vec::new(),
            branch_targets: HashMap::with_capacity(mir.len()),
        }
    }

    /// Runs the full pipeline. On error the whole lowering is abandoned;
    /// no partial output is exposed.
    pub fn lower_mir(&mut self) -> Result<(), CodegenError> {
        self.assign_positions();
        self.encode_instructions()?;
        self.patch_relocations()?;
        debug!(
            words = self.instructions.len(),
            relocations = self.relocations.len(),
            "lowered function body"
        );
        Ok(())
    }

    /// The encoded words, in MIR order with pseudos removed.
    pub fn instructions(&self) -> &[u32] {
        &self.instructions
    }

    /// The collected relocations, already applied.
    pub fn relocations(&self) -> &[Reloc] {
        &self.relocations
    }

    /// Word position of each MIR index. Pseudo instructions map to the
    /// position of the next real instruction.
    pub fn branch_targets(&self) -> &HashMap<InstIndex, u32> {
        &self.branch_targets
    }

    /// Pass 1: walk MIR with a running word counter; every index gets the
    /// counter value, and only real instructions advance it.
    fn assign_positions(&mut self) {
        let mut counter = 0u32;
        for (i, inst) in self.mir.instructions.iter().enumerate() {
            self.branch_targets.insert(InstIndex(i as u32), counter);
            if !inst.is_pseudo() {
                counter += 1;
            }
        }
        trace!(positions = self.branch_targets.len(), "assigned positions");
    }

    /// Pass 2: encode every real instruction, collecting a relocation for
    /// each branch that needs late resolution.
    fn encode_instructions(&mut self) -> Result<(), CodegenError> {
        for (i, inst) in self.mir.instructions.iter().enumerate() {
            let index = InstIndex(i as u32);
            if inst.is_pseudo() {
                continue;
            }

            if let Some(kind) = reloc_kind(inst.tag) {
                let target = match inst.data {
                    Data::Rel { target }
                    | Data::CondRel { target, .. }
                    | Data::RBitRel { target, .. } => target,
                    Data::RegCond {
                        target: Some(target),
                        ..
                    } => target,
                    Data::RegCond { target: None, .. } => {
                        return Err(CodegenError::UnresolvedBranchTarget(index));
                    }
                    _ => return Err(CodegenError::encode(index, EncodeError::InvalidOperands)),
                };
                if target.index() >= self.mir.len() {
                    return Err(CodegenError::TargetOutOfBounds {
                        inst: index,
                        target,
                    });
                }
                let word = encode(inst).map_err(|e| CodegenError::encode(index, e))?;
                self.relocations.push(Reloc {
                    source: self.instructions.len() as u32,
                    target,
                    kind,
                });
                self.instructions.push(word);
                continue;
            }

            if let (Tag::Raw, Data::Imm32 { imm }) = (inst.tag, inst.data) {
                self.instructions.push(imm);
                continue;
            }

            let word = encode(inst).map_err(|e| CodegenError::encode(index, e))?;
            self.instructions.push(word);
        }
        Ok(())
    }

    /// Pass 3: install the final immediate of every relocated branch.
    /// Deltas are measured in instructions, not bytes.
    fn patch_relocations(&mut self) -> Result<(), CodegenError> {
        let Lower {
            instructions,
            relocations,
            branch_targets,
            ..
        } = self;
        for reloc in relocations.iter() {
            if !reloc.kind.is_intra_function() {
                return Err(CodegenError::ReservedRelocation(reloc.kind));
            }
            let target = *branch_targets
                .get(&reloc.target)
                .ok_or(CodegenError::UnresolvedBranchTarget(reloc.target))?;
            let delta = i64::from(target) - i64::from(reloc.source);

            let bits = reloc.kind.bits();
            let bound = 1i64 << (bits - 1);
            if delta < -bound || delta >= bound {
                return Err(CodegenError::BranchOutOfRange {
                    kind: reloc.kind,
                    delta,
                });
            }

            let word = &mut instructions[reloc.source as usize];
            *word = (*word & reloc.kind.keep_mask()) | reloc.kind.field(delta);
            trace!(
                source = reloc.source,
                target = %reloc.target,
                delta,
                "patched branch immediate"
            );
        }
        Ok(())
    }
}

/// The relocation kind of a late-resolved branch tag.
fn reloc_kind(tag: Tag) -> Option<RelocKind> {
    match tag {
        Tag::B | Tag::Bl => Some(RelocKind::Branch26),
        Tag::BCond => Some(RelocKind::Branch19),
        Tag::Cbz | Tag::Cbnz => Some(RelocKind::Cbz19),
        Tag::Tbz | Tag::Tbnz => Some(RelocKind::Tbz14),
        _ => None,
    }
}
