//! Word-level encoding checks against reference assembler output.

use aarch64_codegen::prelude::*;
use aarch64_codegen::bits::reg::SysReg;
use aarch64_codegen::mir::build;

use rstest::rstest;

fn x(n: u8) -> Reg {
    Reg::x(n)
}

fn w(n: u8) -> Reg {
    Reg::w(n)
}

#[test]
fn ret_is_the_canonical_word() {
    assert_eq!(encode(&build::ret()), Ok(0xd65f_03c0));
}

#[test]
fn add_shifted_register_fields() {
    // add x0, x1, x2: sf=1, Rd=0, Rn=1, Rm=2, op=0, S=0.
    let word = encode(&build::add(x(0), x(1), x(2))).unwrap();
    assert_eq!(word, 0x8b02_0020);
    assert_eq!(word >> 31, 1); // sf
    assert_eq!(word & 0x1f, 0); // Rd
    assert_eq!((word >> 5) & 0x1f, 1); // Rn
    assert_eq!((word >> 16) & 0x1f, 2); // Rm
}

#[rstest]
// Arithmetic, register and immediate forms.
#[case(build::sub(x(0), x(1), x(2)), 0xcb02_0020)]
#[case(build::add_imm(w(3), w(4), 15), 0x1100_3c83)]
#[case(build::add_imm(x(0), Reg::Sp, 16), 0x9100_43e0)]
#[case(build::add_imm(x(0), x(1), 1 << 12), 0x9140_0420)]
#[case(build::cmp(x(1), x(2)), 0xeb02_003f)]
// Moves.
#[case(build::movz(x(0), 0x1234), 0xd282_4680)]
#[case(build::movz(x(0), 0x5678 << 16), 0xd2aa_cf00)]
#[case(Inst::new(Tag::Movk, Data::Ri { rd: w(5), imm: Imm::Unsigned(0xffff) }), 0x729f_ffe5)]
#[case(build::mov(x(0), x(1)), 0xaa01_03e0)]
#[case(build::mov(Reg::Sp, x(5)), 0x9100_00bf)]
// Loads and stores across addressing modes.
#[case(build::ldr(x(0), Mem::offset(x(1), 8)), 0xf940_0420)]
#[case(build::ldr(x(0), Mem::offset(x(1), -8)), 0xf85f_8020)]
#[case(build::str(w(2), Mem::offset(Reg::Sp, 4)), 0xb900_07e2)]
#[case(build::ldr(x(0), Mem::reg_offset(x(1), x(2), 0, MemExtend::Lsl)), 0xf862_6820)]
#[case(build::ldr(x(0), Mem::reg_offset(x(1), w(2), 3, MemExtend::Uxtw)), 0xf862_5820)]
#[case(build::stp(Reg::FP, Reg::LR, Mem::pre_index(Reg::Sp, -16)), 0xa9bf_7bfd)]
#[case(build::ldp(Reg::FP, Reg::LR, Mem::post_index(Reg::Sp, 16)), 0xa8c1_7bfd)]
// Logical immediates.
#[case(Inst::new(Tag::And, Data::RrBitmask { rd: x(0), rn: x(1), imm: 0xff }), 0x9240_1c20)]
#[case(Inst::new(Tag::Orr, Data::RrBitmask { rd: w(0), rn: w(1), imm: 0x0101_0101 }), 0x3200_c020)]
// Bitfield forms and aliases.
#[case(Inst::new(Tag::Lsl, Data::Rri { rd: x(0), rn: x(1), imm: Imm::Unsigned(4) }), 0xd37c_ec20)]
#[case(Inst::new(Tag::Lsr, Data::Rri { rd: x(0), rn: x(1), imm: Imm::Unsigned(4) }), 0xd344_fc20)]
#[case(Inst::new(Tag::Ubfm, Data::RrLsbWidth { rd: x(0), rn: x(1), lsb: 8, width: 4 }), 0xd348_2c20)]
#[case(Inst::new(Tag::Sxtw, Data::Rr { rd: x(0), rn: w(1) }), 0x9340_7c20)]
// Conditional select family.
#[case(Inst::new(Tag::Csel, Data::Rrrc { rd: x(0), rn: x(1), rm: x(2), cond: Cond::Eq }), 0x9a82_0020)]
#[case(Inst::new(Tag::Cset, Data::Rc { rd: x(0), cond: Cond::Ne }), 0x9a9f_07e0)]
// Multiplies and divides.
#[case(Inst::new(Tag::Mul, Data::Rrr { rd: x(0), rn: x(1), rm: x(2) }), 0x9b02_7c20)]
#[case(Inst::new(Tag::Sdiv, Data::Rrr { rd: x(0), rn: x(1), rm: x(2) }), 0x9ac2_0c20)]
// System.
#[case(build::nop(), 0xd503_201f)]
#[case(Inst::new(Tag::Brk, Data::Imm32 { imm: 0 }), 0xd420_0000)]
#[case(Inst::new(Tag::Svc, Data::Imm32 { imm: 0 }), 0xd400_0001)]
#[case(Inst::new(Tag::Mrs, Data::RSys { rt: x(0), sys: SysReg::Nzcv }), 0xd53b_4200)]
#[case(Inst::new(Tag::Msr, Data::RSys { rt: x(0), sys: SysReg::Nzcv }), 0xd51b_4200)]
// Acquire/release and exclusives.
#[case(Inst::new(Tag::Ldar, Data::Rr { rd: x(0), rn: x(1) }), 0xc8df_fc20)]
#[case(Inst::new(Tag::Ldaxr, Data::Rr { rd: w(1), rn: x(2) }), 0x885f_fc41)]
#[case(Inst::new(Tag::Stxr, Data::Rrr { rd: w(0), rn: x(1), rm: x(2) }), 0xc800_7c41)]
// Floating point.
#[case(Inst::new(Tag::Fadd, Data::Rrr { rd: Reg::d(0), rn: Reg::d(1), rm: Reg::d(2) }), 0x1e62_2820)]
#[case(Inst::new(Tag::Fmov, Data::Rr { rd: x(0), rn: Reg::d(1) }), 0x9e66_0020)]
#[case(Inst::new(Tag::Scvtf, Data::Rr { rd: Reg::d(0), rn: x(1) }), 0x9e62_0020)]
#[case(Inst::new(Tag::Fcvtzs, Data::Rr { rd: x(0), rn: Reg::d(1) }), 0x9e78_0020)]
// PC-relative addresses.
#[case(Inst::new(Tag::Adr, Data::Ri { rd: x(0), imm: Imm::Signed(16) }), 0x1000_0080)]
#[case(Inst::new(Tag::Adr, Data::Ri { rd: x(1), imm: Imm::Signed(-4) }), 0x10ff_ffe1)]
fn reference_encodings(#[case] inst: Inst, #[case] expected: u32) {
    assert_eq!(encode(&inst), Ok(expected), "for `{inst}`");
}

#[rstest]
// Branch placeholders carry an all-zero immediate field.
#[case(build::b(InstIndex(9)), 0x1400_0000)]
#[case(build::bl(InstIndex(9)), 0x9400_0000)]
#[case(build::b_cond(Cond::Eq, InstIndex(9)), 0x5400_0000)]
#[case(build::cbz(w(5), InstIndex(9)), 0x3400_0005)]
#[case(build::cbnz(x(5), InstIndex(9)), 0xb500_0005)]
#[case(build::tbz(x(3), 33, InstIndex(9)), 0xb608_0003)]
#[case(build::tbnz(w(3), 1, InstIndex(9)), 0x3708_0003)]
fn branch_placeholders(#[case] inst: Inst, #[case] expected: u32) {
    assert_eq!(encode(&inst), Ok(expected), "for `{inst}`");
}

#[rstest]
#[case(build::add(x(0), w(1), x(2)), EncodeError::InvalidRegister)]
#[case(build::add(Reg::Sp, x(1), x(2)), EncodeError::InvalidRegister)]
#[case(build::add_imm(x(0), x(1), 4097), EncodeError::InvalidImmediate)]
#[case(build::movz(x(0), 0x1_0001), EncodeError::InvalidImmediate)]
#[case(build::movz(w(0), 0x1_0000_0000), EncodeError::InvalidImmediate)]
#[case(Inst::new(Tag::And, Data::RrBitmask { rd: x(0), rn: x(1), imm: 0 }), EncodeError::InvalidImmediate)]
#[case(Inst::new(Tag::Fadd, Data::Rrr { rd: x(0), rn: x(1), rm: x(2) }), EncodeError::InvalidRegister)]
#[case(Inst::new(Tag::Fadd, Data::Rrr { rd: Reg::d(0), rn: Reg::d(1), rm: Reg::s(2) }), EncodeError::InvalidRegister)]
#[case(build::ldr(x(0), Mem::offset(x(1), 0x8000)), EncodeError::InvalidImmediate)]
#[case(build::ldr(x(0), Mem::reg_offset(x(1), x(2), 2, MemExtend::Lsl)), EncodeError::InvalidImmediate)]
#[case(build::ldr(x(0), Mem::reg_offset(x(1), x(2), 0, MemExtend::Uxtw)), EncodeError::InvalidRegister)]
#[case(Inst::new(Tag::Add, Data::None), EncodeError::InvalidOperands)]
#[case(Inst::new(Tag::Ldp, Data::Rrm { rt: Reg::s(0), rt2: Reg::s(1), mem: Mem::base(Reg::Sp) }), EncodeError::UnimplementedInstruction)]
#[case(build::dbg_line(1, 1), EncodeError::PseudoInstruction)]
fn rejected_encodings(#[case] inst: Inst, #[case] expected: EncodeError) {
    assert_eq!(encode(&inst), Err(expected), "for `{inst:?}`");
}

#[test]
fn tbz_high_bit_requires_a_wide_register() {
    let inst = build::tbz(w(3), 33, InstIndex(0));
    assert_eq!(encode(&inst), Err(EncodeError::InvalidRegister));
}

#[test]
fn unscaled_fallback_only_covers_nine_bits() {
    // -256 fits the unscaled form; -257 fits nothing.
    assert!(encode(&build::ldr(x(0), Mem::offset(x(1), -256))).is_ok());
    assert_eq!(
        encode(&build::ldr(x(0), Mem::offset(x(1), -257))),
        Err(EncodeError::InvalidImmediate)
    );
}

#[test]
fn load_literal_forms() {
    // ldr x0, #16 (pc-relative).
    assert_eq!(
        encode(&build::ldr(x(0), Mem::literal(16))),
        Ok(0x5800_0080)
    );
    // Stores have no literal form.
    assert_eq!(
        encode(&build::str(x(0), Mem::literal(16))),
        Err(EncodeError::InvalidOperands)
    );
}

#[test]
fn encoder_is_pure() {
    let insts = [
        build::add(x(0), x(1), x(2)),
        build::ldr(x(3), Mem::pre_index(Reg::Sp, -32)),
        build::b_cond(Cond::Lt, InstIndex(2)),
        build::dbg_line(1, 1),
    ];
    for inst in &insts {
        assert_eq!(encode(inst), encode(inst));
    }
}
