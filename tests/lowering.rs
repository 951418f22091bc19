//! Pass-pipeline properties: positions, relocation round-trips, pseudo
//! transparency.

use aarch64_codegen::mir::{build, Data, Inst, InstIndex, Mir, Tag};
use aarch64_codegen::prelude::*;

use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;

/// A small random function body whose branches all stay in range.
#[derive(Clone, Debug)]
struct Program(Vec<Inst>);

impl Arbitrary for Program {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = usize::arbitrary(g) % 24 + 1;
        let mut insts = Vec::with_capacity(len);
        for _ in 0..len {
            insts.push(match u8::arbitrary(g) % 8 {
                0 | 1 => build::nop(),
                2 => build::add(Reg::x(0), Reg::x(1), Reg::x(2)),
                3 => build::dbg_line(u32::arbitrary(g) % 1000 + 1, 1),
                4 => Inst::new(Tag::PseudoEnterFrame, Data::None),
                5 => build::b(InstIndex(0)),
                6 => build::cbz(Reg::x(3), InstIndex(0)),
                _ => build::mov(Reg::x(4), Reg::x(5)),
            });
        }
        let n = insts.len() as u32;
        for inst in &mut insts {
            retarget(inst, |_| InstIndex(u32::arbitrary(g) % n));
        }
        Program(insts)
    }
}

fn retarget(inst: &mut Inst, mut f: impl FnMut(InstIndex) -> InstIndex) {
    match &mut inst.data {
        Data::Rel { target }
        | Data::CondRel { target, .. }
        | Data::RBitRel { target, .. } => *target = f(*target),
        Data::RegCond {
            target: Some(target),
            ..
        } => *target = f(*target),
        _ => {}
    }
}

fn mir_of(insts: &[Inst]) -> Mir {
    let mut mir = Mir::new();
    for &inst in insts {
        mir.push(inst);
    }
    mir
}

fn lowered(mir: &Mir) -> (Vec<u32>, Vec<Reloc>) {
    let mut lower = Lower::new(mir);
    lower.lower_mir().expect("in-range program must lower");
    (lower.instructions().to_vec(), lower.relocations().to_vec())
}

/// Sign-extended branch immediate of a patched word.
fn extract_delta(word: u32, kind: RelocKind) -> i64 {
    let (field, bits) = match kind {
        RelocKind::Branch26 => (word & 0x03ff_ffff, 26),
        RelocKind::Branch19 | RelocKind::Cbz19 => ((word >> 5) & 0x7ffff, 19),
        RelocKind::Tbz14 => ((word >> 5) & 0x3fff, 14),
        _ => unreachable!("reserved kinds are never patched"),
    };
    let shift = 64 - bits;
    ((i64::from(field)) << shift) >> shift
}

#[quickcheck]
fn word_count_is_mir_len_minus_pseudos(program: Program) -> bool {
    let mir = mir_of(&program.0);
    let (words, _) = lowered(&mir);
    words.len() == mir.real_len()
}

#[quickcheck]
fn branch_immediates_round_trip(program: Program) -> bool {
    let mir = mir_of(&program.0);
    let mut lower = Lower::new(&mir);
    lower.lower_mir().unwrap();
    lower.relocations().iter().all(|reloc| {
        let word = lower.instructions()[reloc.source as usize];
        let expected =
            i64::from(lower.branch_targets()[&reloc.target]) - i64::from(reloc.source);
        extract_delta(word, reloc.kind) == expected
    })
}

#[quickcheck]
fn inserting_a_pseudo_changes_no_bytes(program: Program, at: usize) -> bool {
    let insts = program.0;
    let at = at % (insts.len() + 1);

    let mut with_pseudo: Vec<Inst> = insts.clone();
    with_pseudo.insert(at, build::dbg_line(1, 1));
    for inst in &mut with_pseudo {
        retarget(inst, |t| {
            if t.index() >= at {
                InstIndex(t.0 + 1)
            } else {
                t
            }
        });
    }

    let (base, _) = lowered(&mir_of(&insts));
    let (shifted, _) = lowered(&mir_of(&with_pseudo));
    base == shifted
}

#[test]
fn pseudo_between_branch_and_target() {
    // [add, dbg_line, add, b -> 0] produces three words and the B word's
    // imm26 is -2.
    let mut mir = Mir::new();
    mir.push(build::add(Reg::x(0), Reg::x(1), Reg::x(2)));
    mir.push(build::dbg_line(7, 3));
    mir.push(build::add(Reg::x(3), Reg::x(4), Reg::x(5)));
    mir.push(build::b(InstIndex(0)));
    let (words, relocs) = lowered(&mir);
    assert_eq!(words.len(), 3);
    assert_eq!(relocs.len(), 1);
    assert_eq!(extract_delta(words[2], RelocKind::Branch26), -2);
}

#[test]
fn distant_test_branch_overflows_its_field() {
    // A tbz can reach +/- 8192 instructions; 10000 is out of range.
    let mut mir = Mir::new();
    mir.push(build::tbz(Reg::x(0), 3, InstIndex(10_000)));
    for _ in 0..10_000 {
        mir.push(build::nop());
    }
    let mut lower = Lower::new(&mir);
    assert!(matches!(
        lower.lower_mir(),
        Err(CodegenError::BranchOutOfRange {
            kind: RelocKind::Tbz14,
            delta: 10_000,
        })
    ));
}

#[test]
fn distant_unconditional_branch_is_fine() {
    let mut mir = Mir::new();
    mir.push(build::b(InstIndex(10_000)));
    for _ in 0..10_000 {
        mir.push(build::nop());
    }
    let (words, _) = lowered(&mir);
    assert_eq!(extract_delta(words[0], RelocKind::Branch26), 10_000);
}

#[test]
fn conditional_branch_window_boundaries() {
    // 2^18 - 1 forward is the last representable b.cond delta.
    let limit = 1 << 18;
    let mut mir = Mir::new();
    mir.push(build::b_cond(Cond::Ne, InstIndex(limit - 1)));
    for _ in 0..limit {
        mir.push(build::nop());
    }
    let (words, _) = lowered(&mir);
    assert_eq!(
        extract_delta(words[0], RelocKind::Branch19),
        i64::from(limit) - 1
    );

    let mut mir = Mir::new();
    mir.push(build::b_cond(Cond::Ne, InstIndex(limit)));
    for _ in 0..limit {
        mir.push(build::nop());
    }
    let mut lower = Lower::new(&mir);
    assert!(matches!(
        lower.lower_mir(),
        Err(CodegenError::BranchOutOfRange { .. })
    ));
}

#[test]
fn branch_to_trailing_pseudo_resolves_past_the_end() {
    // A branch to a trailing pseudo lands one past the last word, which
    // is still a representable delta.
    let mut mir = Mir::new();
    mir.push(build::b(InstIndex(2)));
    mir.push(build::ret());
    mir.push(build::dbg_line(9, 9));
    let (words, _) = lowered(&mir);
    assert_eq!(extract_delta(words[0], RelocKind::Branch26), 2);
}
