//! Pure mapping from one MIR instruction onto its 32-bit ARM64 word.
//!
//! [`encode`] is a function of the instruction alone: no state, no
//! position information. Branch instructions that need late resolution
//! are emitted with an all-zero immediate field; the lowering pass
//! patches the real offset in once positions are known.

pub mod bitmask;

use bitmask::encode_bitmask;

use crate::bits::cond::Cond;
use crate::bits::mem::{Mem, MemExtend};
use crate::bits::reg::{Reg, RegClass, SysReg};
use crate::bits::ShiftOp;
use crate::error::EncodeError;
use crate::mir::{Data, Inst, Tag};

type Word = Result<u32, EncodeError>;

/// Encodes one MIR instruction into its 32-bit machine word.
///
/// Pseudo instructions are rejected with [`EncodeError::PseudoInstruction`];
/// the caller filters them. `Raw` words are returned verbatim.
pub fn encode(inst: &Inst) -> Word {
    if inst.tag.is_pseudo() {
        return Err(EncodeError::PseudoInstruction);
    }

    match (inst.tag, inst.data) {
        // --- Integer arithmetic -----------------------------------------
        (Tag::Add, Data::Rri { rd, rn, imm }) => add_sub_imm(0, 0, rd, rn, imm.as_u64()),
        (Tag::Adds, Data::Rri { rd, rn, imm }) => add_sub_imm(0, 1, rd, rn, imm.as_u64()),
        (Tag::Sub, Data::Rri { rd, rn, imm }) => add_sub_imm(1, 0, rd, rn, imm.as_u64()),
        (Tag::Subs, Data::Rri { rd, rn, imm }) => add_sub_imm(1, 1, rd, rn, imm.as_u64()),

        (Tag::Add, Data::Rrr { rd, rn, rm }) => add_sub_reg(0, 0, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Adds, Data::Rrr { rd, rn, rm }) => add_sub_reg(0, 1, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Sub, Data::Rrr { rd, rn, rm }) => add_sub_reg(1, 0, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Subs, Data::Rrr { rd, rn, rm }) => add_sub_reg(1, 1, rd, rn, rm, ShiftOp::Lsl, 0),
        (
            Tag::Add,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => add_sub_reg(0, 0, rd, rn, rm, shift, amount),
        (
            Tag::Adds,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => add_sub_reg(0, 1, rd, rn, rm, shift, amount),
        (
            Tag::Sub,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => add_sub_reg(1, 0, rd, rn, rm, shift, amount),
        (
            Tag::Subs,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => add_sub_reg(1, 1, rd, rn, rm, shift, amount),

        (Tag::Cmp, Data::Rr { rd: rn, rn: rm }) => {
            let zr = zr_for(rn);
            add_sub_reg(1, 1, zr, rn, rm, ShiftOp::Lsl, 0)
        }
        (Tag::Cmn, Data::Rr { rd: rn, rn: rm }) => {
            let zr = zr_for(rn);
            add_sub_reg(0, 1, zr, rn, rm, ShiftOp::Lsl, 0)
        }
        (Tag::Cmp, Data::Ri { rd: rn, imm }) => add_sub_imm(1, 1, zr_for(rn), rn, imm.as_u64()),
        (Tag::Cmn, Data::Ri { rd: rn, imm }) => add_sub_imm(0, 1, zr_for(rn), rn, imm.as_u64()),

        (Tag::Adc, Data::Rrr { rd, rn, rm }) => carry_op(0, rd, rn, rm),
        (Tag::Sbc, Data::Rrr { rd, rn, rm }) => carry_op(1, rd, rn, rm),

        (Tag::Madd, Data::Rrrr { rd, rn, rm, ra }) => mul_add(0, rd, rn, rm, ra),
        (Tag::Msub, Data::Rrrr { rd, rn, rm, ra }) => mul_add(1, rd, rn, rm, ra),
        (Tag::Mul, Data::Rrr { rd, rn, rm }) => mul_add(0, rd, rn, rm, zr_for(rd)),
        (Tag::Smulh, Data::Rrr { rd, rn, rm }) => mul_high(0, rd, rn, rm),
        (Tag::Umulh, Data::Rrr { rd, rn, rm }) => mul_high(1, rd, rn, rm),
        (Tag::Sdiv, Data::Rrr { rd, rn, rm }) => dp_two_source(0b000011, rd, rn, rm),
        (Tag::Udiv, Data::Rrr { rd, rn, rm }) => dp_two_source(0b000010, rd, rn, rm),

        // --- Logical ----------------------------------------------------
        (Tag::And, Data::Rrr { rd, rn, rm }) => logical_reg(0b00, 0, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Orr, Data::Rrr { rd, rn, rm }) => logical_reg(0b01, 0, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Eor, Data::Rrr { rd, rn, rm }) => logical_reg(0b10, 0, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Ands, Data::Rrr { rd, rn, rm }) => logical_reg(0b11, 0, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Bic, Data::Rrr { rd, rn, rm }) => logical_reg(0b00, 1, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Orn, Data::Rrr { rd, rn, rm }) => logical_reg(0b01, 1, rd, rn, rm, ShiftOp::Lsl, 0),
        (Tag::Eon, Data::Rrr { rd, rn, rm }) => logical_reg(0b10, 1, rd, rn, rm, ShiftOp::Lsl, 0),
        (
            Tag::And,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => logical_reg(0b00, 0, rd, rn, rm, shift, amount),
        (
            Tag::Orr,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => logical_reg(0b01, 0, rd, rn, rm, shift, amount),
        (
            Tag::Eor,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => logical_reg(0b10, 0, rd, rn, rm, shift, amount),
        (
            Tag::Ands,
            Data::RrrShift {
                rd,
                rn,
                rm,
                shift,
                amount,
            },
        ) => logical_reg(0b11, 0, rd, rn, rm, shift, amount),
        (Tag::Tst, Data::Rr { rd: rn, rn: rm }) => {
            logical_reg(0b11, 0, zr_for(rn), rn, rm, ShiftOp::Lsl, 0)
        }

        (Tag::And, Data::RrBitmask { rd, rn, imm }) => logical_imm(0b00, rd, rn, imm, true),
        (Tag::Orr, Data::RrBitmask { rd, rn, imm }) => logical_imm(0b01, rd, rn, imm, true),
        (Tag::Eor, Data::RrBitmask { rd, rn, imm }) => logical_imm(0b10, rd, rn, imm, true),
        (Tag::Ands, Data::RrBitmask { rd, rn, imm }) => logical_imm(0b11, rd, rn, imm, false),
        (Tag::Tst, Data::Ri { rd: rn, imm }) => {
            logical_imm(0b11, zr_for(rn), rn, imm.as_u64(), false)
        }

        (Tag::MovReg, Data::Rr { rd, rn }) => mov_reg(rd, rn),

        // --- Shifts and single-source bit operations --------------------
        (Tag::Lsl, Data::Rrr { rd, rn, rm }) => dp_two_source(0b001000, rd, rn, rm),
        (Tag::Lsr, Data::Rrr { rd, rn, rm }) => dp_two_source(0b001001, rd, rn, rm),
        (Tag::Asr, Data::Rrr { rd, rn, rm }) => dp_two_source(0b001010, rd, rn, rm),
        (Tag::Ror, Data::Rrr { rd, rn, rm }) => dp_two_source(0b001011, rd, rn, rm),
        (Tag::Lsl, Data::Rri { rd, rn, imm }) => shift_imm(ShiftOp::Lsl, rd, rn, imm.as_u64()),
        (Tag::Lsr, Data::Rri { rd, rn, imm }) => shift_imm(ShiftOp::Lsr, rd, rn, imm.as_u64()),
        (Tag::Asr, Data::Rri { rd, rn, imm }) => shift_imm(ShiftOp::Asr, rd, rn, imm.as_u64()),
        (Tag::Ror, Data::Rri { rd, rn, imm }) => shift_imm(ShiftOp::Ror, rd, rn, imm.as_u64()),

        (Tag::Clz, Data::Rr { rd, rn }) => dp_one_source(0b000100, rd, rn),
        (Tag::Rbit, Data::Rr { rd, rn }) => dp_one_source(0b000000, rd, rn),
        (Tag::Rev, Data::Rr { rd, rn }) => {
            let opc = if rd.size() == 64 { 0b000011 } else { 0b000010 };
            dp_one_source(opc, rd, rn)
        }

        // --- Move wide --------------------------------------------------
        (Tag::Movn, Data::Ri { rd, imm }) => move_wide(0b00, rd, imm.as_u64()),
        (Tag::Movz, Data::Ri { rd, imm }) => move_wide(0b10, rd, imm.as_u64()),
        (Tag::Movk, Data::Ri { rd, imm }) => move_wide(0b11, rd, imm.as_u64()),

        // --- Bitfield ---------------------------------------------------
        (Tag::Sbfm, Data::RrLsbWidth { rd, rn, lsb, width }) => {
            bitfield_extract(0b00, rd, rn, lsb, width)
        }
        (Tag::Ubfm, Data::RrLsbWidth { rd, rn, lsb, width }) => {
            bitfield_extract(0b10, rd, rn, lsb, width)
        }
        (Tag::Bfm, Data::RrLsbWidth { rd, rn, lsb, width }) => bitfield_insert(rd, rn, lsb, width),
        (Tag::Sxtb, Data::Rr { rd, rn }) => extend_alias(0b00, rd, rn, 7),
        (Tag::Sxth, Data::Rr { rd, rn }) => extend_alias(0b00, rd, rn, 15),
        (Tag::Sxtw, Data::Rr { rd, rn }) => extend_alias(0b00, rd, rn, 31),
        (Tag::Uxtb, Data::Rr { rd, rn }) => extend_alias(0b10, rd, rn, 7),
        (Tag::Uxth, Data::Rr { rd, rn }) => extend_alias(0b10, rd, rn, 15),

        // --- Loads and stores -------------------------------------------
        (
            Tag::Ldr | Tag::Ldrb | Tag::Ldrh | Tag::Ldrsb | Tag::Ldrsh | Tag::Ldrsw,
            Data::Rm { rt, mem },
        ) => load_store(inst.tag, rt, mem),
        (Tag::Str | Tag::Strb | Tag::Strh, Data::Mr { mem, rt }) => load_store(inst.tag, rt, mem),
        (Tag::Ldp, Data::Rrm { rt, rt2, mem }) => load_store_pair(1, rt, rt2, mem),
        (Tag::Stp, Data::Mrr { mem, rt, rt2 }) => load_store_pair(0, rt, rt2, mem),

        // --- Branches ---------------------------------------------------
        (Tag::B, Data::Rel { .. }) => Ok(0x1400_0000),
        (Tag::Bl, Data::Rel { .. }) => Ok(0x9400_0000),
        (Tag::Br, Data::R { rd }) => branch_reg(0xd61f_0000, rd),
        (Tag::Blr, Data::R { rd }) => branch_reg(0xd63f_0000, rd),
        (Tag::Ret, Data::R { rd }) => branch_reg(0xd65f_0000, rd),
        (Tag::BCond, Data::CondRel { cond, .. }) => Ok(0x5400_0000 | cond.bits()),
        (Tag::Cbz, Data::RegCond { rn, cond, .. }) => compare_branch(0, rn, cond),
        (Tag::Cbnz, Data::RegCond { rn, cond, .. }) => compare_branch(1, rn, cond),
        (Tag::Tbz, Data::RBitRel { rn, bit, .. }) => test_branch(0, rn, bit),
        (Tag::Tbnz, Data::RBitRel { rn, bit, .. }) => test_branch(1, rn, bit),

        // --- Conditional select -----------------------------------------
        (Tag::Csel, Data::Rrrc { rd, rn, rm, cond }) => cond_select(0, 0b00, rd, rn, rm, cond),
        (Tag::Csinc, Data::Rrrc { rd, rn, rm, cond }) => cond_select(0, 0b01, rd, rn, rm, cond),
        (Tag::Csinv, Data::Rrrc { rd, rn, rm, cond }) => cond_select(1, 0b00, rd, rn, rm, cond),
        (Tag::Csneg, Data::Rrrc { rd, rn, rm, cond }) => cond_select(1, 0b01, rd, rn, rm, cond),
        (Tag::Cset, Data::Rc { rd, cond }) => {
            let zr = zr_for(rd);
            alias_cond(cond)?;
            cond_select(0, 0b01, rd, zr, zr, cond.invert())
        }
        (Tag::Cinc, Data::Rrc { rd, rn, cond }) => {
            alias_cond(cond)?;
            cond_select(0, 0b01, rd, rn, rn, cond.invert())
        }

        // --- System -----------------------------------------------------
        (Tag::Nop, Data::None) => Ok(0xd503_201f),
        (Tag::Brk, Data::Imm32 { imm }) => exception(0xd420_0000, imm),
        (Tag::Svc, Data::Imm32 { imm }) => exception(0xd400_0001, imm),
        (Tag::Dmb, Data::None) => Ok(0xd503_3fbf),
        (Tag::Dsb, Data::None) => Ok(0xd503_3f9f),
        (Tag::Isb, Data::None) => Ok(0xd503_3fdf),
        (Tag::Mrs, Data::RSys { rt, sys }) => system_reg(0xd530_0000, rt, sys),
        (Tag::Msr, Data::RSys { rt, sys }) => system_reg(0xd510_0000, rt, sys),

        // --- Exclusive and acquire/release ------------------------------
        (Tag::Ldxr, Data::Rr { rd, rn }) => load_acquire(0, 1, 0, rd, rn),
        (Tag::Ldaxr, Data::Rr { rd, rn }) => load_acquire(0, 1, 1, rd, rn),
        (Tag::Ldar, Data::Rr { rd, rn }) => load_acquire(1, 1, 1, rd, rn),
        (Tag::Stlr, Data::Rr { rd, rn }) => load_acquire(1, 0, 1, rd, rn),
        (Tag::Stxr, Data::Rrr { rd, rn, rm }) => store_exclusive(0, rd, rn, rm),
        (Tag::Stlxr, Data::Rrr { rd, rn, rm }) => store_exclusive(1, rd, rn, rm),

        // --- Floating point ---------------------------------------------
        (Tag::Fadd, Data::Rrr { rd, rn, rm }) => fp_two_source(0b0010, rd, rn, rm),
        (Tag::Fsub, Data::Rrr { rd, rn, rm }) => fp_two_source(0b0011, rd, rn, rm),
        (Tag::Fmul, Data::Rrr { rd, rn, rm }) => fp_two_source(0b0000, rd, rn, rm),
        (Tag::Fdiv, Data::Rrr { rd, rn, rm }) => fp_two_source(0b0001, rd, rn, rm),
        (Tag::Fcmp, Data::Rr { rd: rn, rn: rm }) => fp_compare(rn, rm),
        (Tag::Fmov, Data::Rr { rd, rn }) => fmov(rd, rn),
        (Tag::Fabs, Data::Rr { rd, rn }) => fp_one_source(0b000001, rd, rn),
        (Tag::Fneg, Data::Rr { rd, rn }) => fp_one_source(0b000010, rd, rn),
        (Tag::Fsqrt, Data::Rr { rd, rn }) => fp_one_source(0b000011, rd, rn),
        (Tag::Fcvt, Data::Rr { rd, rn }) => fp_convert_precision(rd, rn),
        (Tag::Scvtf, Data::Rr { rd, rn }) => int_to_fp(0b010, rd, rn),
        (Tag::Ucvtf, Data::Rr { rd, rn }) => int_to_fp(0b011, rd, rn),
        (Tag::Fcvtzs, Data::Rr { rd, rn }) => fp_to_int(0b000, rd, rn),
        (Tag::Fcvtzu, Data::Rr { rd, rn }) => fp_to_int(0b001, rd, rn),

        // --- Addresses and raw words ------------------------------------
        (Tag::Adr, Data::Ri { rd, imm }) => pc_rel(0x1000_0000, rd, imm.as_i64()),
        (Tag::Adrp, Data::Ri { rd, imm }) => pc_rel(0x9000_0000, rd, imm.as_i64()),
        (Tag::Raw, Data::Imm32 { imm }) => Ok(imm),

        _ => Err(EncodeError::InvalidOperands),
    }
}

// --- Register field helpers ---------------------------------------------

/// The zero register of the same width as `reg`.
const fn zr_for(reg: Reg) -> Reg {
    match reg.size() {
        64 => Reg::Xzr,
        _ => Reg::Wzr,
    }
}

/// The `sf` bit derived from a general-purpose operand width.
fn sf(reg: Reg) -> Word {
    match reg.size() {
        64 => Ok(1 << 31),
        32 => Ok(0),
        _ => Err(EncodeError::InvalidRegister),
    }
}

/// Field value of a general-purpose register where id 31 means ZR.
fn gp_zr(reg: Reg) -> Word {
    match reg.class() {
        RegClass::GeneralPurpose => Ok(reg.id() as u32),
        _ => Err(EncodeError::InvalidRegister),
    }
}

/// Field value of a general-purpose register where id 31 means SP.
fn gp_sp(reg: Reg) -> Word {
    if reg.is_zr() {
        return Err(EncodeError::InvalidRegister);
    }
    match reg.class() {
        RegClass::GeneralPurpose | RegClass::Special => Ok(reg.id() as u32),
        RegClass::Vector => Err(EncodeError::InvalidRegister),
    }
}

/// A 64-bit base address register; SP allowed.
fn base_reg(mem: Mem) -> Word {
    let base = mem.base_reg().ok_or(EncodeError::InvalidOperands)?;
    if base.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    gp_sp(base)
}

fn check_same_width(a: Reg, b: Reg) -> Result<(), EncodeError> {
    if a.size() == b.size() {
        Ok(())
    } else {
        Err(EncodeError::InvalidRegister)
    }
}

fn alias_cond(cond: Cond) -> Result<(), EncodeError> {
    match cond {
        Cond::Al | Cond::Nv => Err(EncodeError::InvalidOperands),
        _ => Ok(()),
    }
}

// --- Encoding families ---------------------------------------------------

fn add_sub_imm(op: u32, s: u32, rd: Reg, rn: Reg, value: u64) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    // The id-31 slot of Rd is SP for the plain forms and ZR when flags
    // are set; Rn is always SP-capable.
    let rd = if s == 0 { gp_sp(rd)? } else { gp_zr(rd)? };
    let rn = gp_sp(rn)?;
    let (sh, imm12) = if value < (1 << 12) {
        (0, value as u32)
    } else if value & 0xfff == 0 && (value >> 12) < (1 << 12) {
        (1, (value >> 12) as u32)
    } else {
        return Err(EncodeError::InvalidImmediate);
    };
    Ok(sf | (op << 30) | (s << 29) | (0b10001 << 24) | (sh << 22) | (imm12 << 10) | (rn << 5) | rd)
}

fn add_sub_reg(op: u32, s: u32, rd: Reg, rn: Reg, rm: Reg, shift: ShiftOp, amount: u8) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    if matches!(shift, ShiftOp::Ror) {
        return Err(EncodeError::InvalidOperands);
    }
    if u16::from(amount) >= rd.size() {
        return Err(EncodeError::InvalidImmediate);
    }
    let (rd, rn, rm) = (gp_zr(rd)?, gp_zr(rn)?, gp_zr(rm)?);
    Ok(sf
        | (op << 30)
        | (s << 29)
        | (0b01011 << 24)
        | (shift.bits() << 22)
        | (rm << 16)
        | ((amount as u32) << 10)
        | (rn << 5)
        | rd)
}

fn carry_op(op: u32, rd: Reg, rn: Reg, rm: Reg) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    let (rd, rn, rm) = (gp_zr(rd)?, gp_zr(rn)?, gp_zr(rm)?);
    Ok(sf | (op << 30) | (0b11010000 << 21) | (rm << 16) | (rn << 5) | rd)
}

fn mul_add(o0: u32, rd: Reg, rn: Reg, rm: Reg, ra: Reg) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    check_same_width(rd, ra)?;
    let (rd, rn, rm, ra) = (gp_zr(rd)?, gp_zr(rn)?, gp_zr(rm)?, gp_zr(ra)?);
    Ok(sf | (0b11011 << 24) | (rm << 16) | (o0 << 15) | (ra << 10) | (rn << 5) | rd)
}

fn mul_high(u: u32, rd: Reg, rn: Reg, rm: Reg) -> Word {
    if rd.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    let (rd, rn, rm) = (gp_zr(rd)?, gp_zr(rn)?, gp_zr(rm)?);
    Ok(0x9b40_7c00 | (u << 23) | (rm << 16) | (rn << 5) | rd)
}

fn dp_two_source(opcode: u32, rd: Reg, rn: Reg, rm: Reg) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    let (rd, rn, rm) = (gp_zr(rd)?, gp_zr(rn)?, gp_zr(rm)?);
    Ok(sf | (0b11010110 << 21) | (rm << 16) | (opcode << 10) | (rn << 5) | rd)
}

fn dp_one_source(opcode: u32, rd: Reg, rn: Reg) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    let (rd, rn) = (gp_zr(rd)?, gp_zr(rn)?);
    Ok(sf | (1 << 30) | (0b11010110 << 21) | (opcode << 10) | (rn << 5) | rd)
}

fn logical_reg(opc: u32, n: u32, rd: Reg, rn: Reg, rm: Reg, shift: ShiftOp, amount: u8) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    if u16::from(amount) >= rd.size() {
        return Err(EncodeError::InvalidImmediate);
    }
    let (rd, rn, rm) = (gp_zr(rd)?, gp_zr(rn)?, gp_zr(rm)?);
    Ok(sf
        | (opc << 29)
        | (0b01010 << 24)
        | (shift.bits() << 22)
        | (n << 21)
        | (rm << 16)
        | ((amount as u32) << 10)
        | (rn << 5)
        | rd)
}

fn logical_imm(opc: u32, rd: Reg, rn: Reg, value: u64, rd_is_sp_slot: bool) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    let width = rd.size();
    let rd = if rd_is_sp_slot { gp_sp(rd)? } else { gp_zr(rd)? };
    let rn = gp_zr(rn)?;
    let mask = encode_bitmask(value, width).ok_or(EncodeError::InvalidImmediate)?;
    Ok(sf
        | (opc << 29)
        | (0b100100 << 23)
        | (mask.n << 22)
        | (mask.immr << 16)
        | (mask.imms << 10)
        | (rn << 5)
        | rd)
}

fn mov_reg(rd: Reg, rn: Reg) -> Word {
    check_same_width(rd, rn)?;
    if rd.is_sp() || rn.is_sp() {
        // MOV to or from SP is ADD #0; ZR is meaningless on either side.
        let sf = sf(rd)?;
        let (rd, rn) = (gp_sp(rd)?, gp_sp(rn)?);
        return Ok(sf | (0b10001 << 24) | (rn << 5) | rd);
    }
    let sf = sf(rd)?;
    let (rd, rm) = (gp_zr(rd)?, gp_zr(rn)?);
    Ok(sf | (0b01 << 29) | (0b01010 << 24) | (rm << 16) | (0b11111 << 5) | rd)
}

fn shift_imm(op: ShiftOp, rd: Reg, rn: Reg, amount: u64) -> Word {
    let size = u64::from(rd.size());
    if amount >= size {
        return Err(EncodeError::InvalidImmediate);
    }
    let sh = amount as u8;
    let top = (size - 1) as u8;
    match op {
        ShiftOp::Lsl => bitfield_raw(0b10, rd, rn, ((size as u8).wrapping_sub(sh)) % size as u8, top - sh),
        ShiftOp::Lsr => bitfield_raw(0b10, rd, rn, sh, top),
        ShiftOp::Asr => bitfield_raw(0b00, rd, rn, sh, top),
        ShiftOp::Ror => extract_reg(rd, rn, sh),
    }
}

/// UBFM/SBFM/BFM with already-computed `(immr, imms)` fields.
fn bitfield_raw(opc: u32, rd: Reg, rn: Reg, immr: u8, imms: u8) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    let n = if rd.size() == 64 { 1 } else { 0 };
    let (rd, rn) = (gp_zr(rd)?, gp_zr(rn)?);
    Ok(sf
        | (opc << 29)
        | (0b100110 << 23)
        | (n << 22)
        | ((immr as u32) << 16)
        | ((imms as u32) << 10)
        | (rn << 5)
        | rd)
}

fn bitfield_extract(opc: u32, rd: Reg, rn: Reg, lsb: u8, width: u8) -> Word {
    let size = rd.size() as u32;
    if width == 0 || u32::from(lsb) + u32::from(width) > size {
        return Err(EncodeError::InvalidImmediate);
    }
    bitfield_raw(opc, rd, rn, lsb, lsb + width - 1)
}

fn bitfield_insert(rd: Reg, rn: Reg, lsb: u8, width: u8) -> Word {
    let size = rd.size() as u32;
    if width == 0 || u32::from(lsb) + u32::from(width) > size {
        return Err(EncodeError::InvalidImmediate);
    }
    let immr = ((size - u32::from(lsb)) % size) as u8;
    bitfield_raw(0b01, rd, rn, immr, width - 1)
}

/// The SXT*/UXT* aliases of SBFM/UBFM; width checks are relaxed because
/// the extensions are inherently cross-width.
fn extend_alias(opc: u32, rd: Reg, rn: Reg, imms: u8) -> Word {
    let sf = sf(rd)?;
    let n = if rd.size() == 64 { 1 } else { 0 };
    let (rd, rn) = (gp_zr(rd)?, gp_zr(rn)?);
    Ok(sf | (opc << 29) | (0b100110 << 23) | (n << 22) | ((imms as u32) << 10) | (rn << 5) | rd)
}

/// ROR immediate via EXTR with both sources equal.
fn extract_reg(rd: Reg, rn: Reg, amount: u8) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    let n = if rd.size() == 64 { 1 } else { 0 };
    let (rd, rn) = (gp_zr(rd)?, gp_zr(rn)?);
    Ok(sf
        | (0b100111 << 23)
        | (n << 22)
        | (rn << 16)
        | ((amount as u32) << 10)
        | (rn << 5)
        | rd)
}

fn move_wide(opc: u32, rd: Reg, value: u64) -> Word {
    let sf = sf(rd)?;
    let hw_limit = if rd.size() == 64 { 4 } else { 2 };
    if rd.size() == 32 && value > u32::MAX as u64 {
        return Err(EncodeError::InvalidImmediate);
    }
    let rd = gp_zr(rd)?;
    let (hw, imm16) = split_wide_immediate(value, hw_limit)?;
    Ok(sf | (opc << 29) | (0b100101 << 23) | (hw << 21) | (imm16 << 5) | rd)
}

/// Splits a value into its single nonzero 16-bit chunk.
fn split_wide_immediate(value: u64, hw_limit: u32) -> Result<(u32, u32), EncodeError> {
    if value == 0 {
        return Ok((0, 0));
    }
    for hw in 0..hw_limit {
        let chunk = (value >> (hw * 16)) & 0xffff;
        if chunk != 0 {
            if value != chunk << (hw * 16) {
                return Err(EncodeError::InvalidImmediate);
            }
            return Ok((hw, chunk as u32));
        }
    }
    Err(EncodeError::InvalidImmediate)
}

fn branch_reg(base: u32, rn: Reg) -> Word {
    if rn.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    let rn = gp_zr(rn)?;
    Ok(base | (rn << 5))
}

fn compare_branch(op: u32, rn: Reg, cond: Cond) -> Word {
    // The condition is the tag's canonical sense; a mismatch means the
    // producer built inconsistent data.
    let expected = if op == 0 { Cond::Eq } else { Cond::Ne };
    if cond != expected {
        return Err(EncodeError::InvalidOperands);
    }
    let sf_bit = match rn.size() {
        64 => 1u32 << 31,
        32 => 0,
        _ => return Err(EncodeError::InvalidRegister),
    };
    let rt = gp_zr(rn)?;
    Ok(sf_bit | (0b011010 << 25) | (op << 24) | rt)
}

fn test_branch(op: u32, rn: Reg, bit: u8) -> Word {
    if bit > 63 {
        return Err(EncodeError::InvalidImmediate);
    }
    if bit >= 32 && rn.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    let rt = gp_zr(rn)?;
    let b5 = u32::from(bit >> 5) << 31;
    let b40 = u32::from(bit & 0x1f) << 19;
    Ok(b5 | (0b011011 << 25) | (op << 24) | b40 | rt)
}

fn cond_select(op: u32, op2: u32, rd: Reg, rn: Reg, rm: Reg, cond: Cond) -> Word {
    let sf = sf(rd)?;
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    let (rd, rn, rm) = (gp_zr(rd)?, gp_zr(rn)?, gp_zr(rm)?);
    Ok(sf
        | (op << 30)
        | (0b11010100 << 21)
        | (rm << 16)
        | (cond.bits() << 12)
        | (op2 << 10)
        | (rn << 5)
        | rd)
}

fn exception(base: u32, imm: u32) -> Word {
    if imm > 0xffff {
        return Err(EncodeError::InvalidImmediate);
    }
    Ok(base | (imm << 5))
}

fn system_reg(base: u32, rt: Reg, sys: SysReg) -> Word {
    if rt.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    let rt = gp_zr(rt)?;
    Ok(base | (sys.field() << 5) | rt)
}

fn load_acquire(o2: u32, l: u32, o0: u32, rt: Reg, rn: Reg) -> Word {
    let size = match rt.size() {
        64 => 0b11u32,
        32 => 0b10,
        _ => return Err(EncodeError::InvalidRegister),
    };
    if rn.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    let (rt, rn) = (gp_zr(rt)?, gp_sp(rn)?);
    Ok((size << 30)
        | (0b001000 << 24)
        | (o2 << 23)
        | (l << 22)
        | (0b11111 << 16)
        | (o0 << 15)
        | (0b11111 << 10)
        | (rn << 5)
        | rt)
}

fn store_exclusive(o0: u32, rs: Reg, rt: Reg, rn: Reg) -> Word {
    if rs.size() != 32 {
        return Err(EncodeError::InvalidRegister);
    }
    let size = match rt.size() {
        64 => 0b11u32,
        32 => 0b10,
        _ => return Err(EncodeError::InvalidRegister),
    };
    if rn.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    let (rs, rt, rn) = (gp_zr(rs)?, gp_zr(rt)?, gp_sp(rn)?);
    Ok((size << 30) | (0b001000 << 24) | (rs << 16) | (o0 << 15) | (0b11111 << 10) | (rn << 5) | rt)
}

// --- Loads and stores ----------------------------------------------------

struct LsForm {
    size: u32,
    v: u32,
    opc: u32,
    elem: u32,
}

fn ls_form(tag: Tag, rt: Reg) -> Result<LsForm, EncodeError> {
    let load = matches!(
        tag,
        Tag::Ldr | Tag::Ldrb | Tag::Ldrh | Tag::Ldrsb | Tag::Ldrsh | Tag::Ldrsw
    );
    let form = match (tag, rt) {
        (Tag::Ldr | Tag::Str, Reg::X(_) | Reg::Xzr) => LsForm {
            size: 0b11,
            v: 0,
            opc: load as u32,
            elem: 8,
        },
        (Tag::Ldr | Tag::Str, Reg::W(_) | Reg::Wzr) => LsForm {
            size: 0b10,
            v: 0,
            opc: load as u32,
            elem: 4,
        },
        (Tag::Ldr | Tag::Str, Reg::D(_)) => LsForm {
            size: 0b11,
            v: 1,
            opc: load as u32,
            elem: 8,
        },
        (Tag::Ldr | Tag::Str, Reg::S(_)) => LsForm {
            size: 0b10,
            v: 1,
            opc: load as u32,
            elem: 4,
        },
        (Tag::Ldr | Tag::Str, Reg::H(_)) => LsForm {
            size: 0b01,
            v: 1,
            opc: load as u32,
            elem: 2,
        },
        (Tag::Ldr | Tag::Str, Reg::B(_)) => LsForm {
            size: 0b00,
            v: 1,
            opc: load as u32,
            elem: 1,
        },
        (Tag::Ldr | Tag::Str, Reg::V(_)) => LsForm {
            size: 0b00,
            v: 1,
            opc: 0b10 | load as u32,
            elem: 16,
        },
        (Tag::Ldrb | Tag::Strb, Reg::W(_) | Reg::Wzr) => LsForm {
            size: 0b00,
            v: 0,
            opc: load as u32,
            elem: 1,
        },
        (Tag::Ldrh | Tag::Strh, Reg::W(_) | Reg::Wzr) => LsForm {
            size: 0b01,
            v: 0,
            opc: load as u32,
            elem: 2,
        },
        (Tag::Ldrsb, Reg::X(_) | Reg::Xzr) => LsForm {
            size: 0b00,
            v: 0,
            opc: 0b10,
            elem: 1,
        },
        (Tag::Ldrsb, Reg::W(_) | Reg::Wzr) => LsForm {
            size: 0b00,
            v: 0,
            opc: 0b11,
            elem: 1,
        },
        (Tag::Ldrsh, Reg::X(_) | Reg::Xzr) => LsForm {
            size: 0b01,
            v: 0,
            opc: 0b10,
            elem: 2,
        },
        (Tag::Ldrsh, Reg::W(_) | Reg::Wzr) => LsForm {
            size: 0b01,
            v: 0,
            opc: 0b11,
            elem: 2,
        },
        (Tag::Ldrsw, Reg::X(_) | Reg::Xzr) => LsForm {
            size: 0b10,
            v: 0,
            opc: 0b10,
            elem: 4,
        },
        _ => return Err(EncodeError::InvalidRegister),
    };
    Ok(form)
}

fn load_store(tag: Tag, rt: Reg, mem: Mem) -> Word {
    let form = ls_form(tag, rt)?;
    let rt_field = if form.v == 1 { rt.id() as u32 } else { gp_zr(rt)? };
    let group = (form.size << 30) | (0b111 << 27) | (form.v << 26) | (form.opc << 22);

    match mem {
        Mem::Offset { offset, .. } => {
            let rn = base_reg(mem)?;
            let scaled = offset >= 0
                && offset as u32 % form.elem == 0
                && offset as u32 / form.elem <= 0xfff;
            if scaled {
                let imm12 = offset as u32 / form.elem;
                Ok(group | (0b01 << 24) | (imm12 << 10) | (rn << 5) | rt_field)
            } else if (-256..=255).contains(&offset) {
                // Unscaled LDUR/STUR fallback.
                let imm9 = (offset as u32) & 0x1ff;
                Ok(group | (imm9 << 12) | (rn << 5) | rt_field)
            } else {
                Err(EncodeError::InvalidImmediate)
            }
        }
        Mem::PreIndex { offset, .. } | Mem::PostIndex { offset, .. } => {
            if !(-256..=255).contains(&offset) {
                return Err(EncodeError::InvalidImmediate);
            }
            let rn = base_reg(mem)?;
            let imm9 = (offset as u32) & 0x1ff;
            let idx = if matches!(mem, Mem::PreIndex { .. }) {
                0b11
            } else {
                0b01
            };
            Ok(group | (imm9 << 12) | (idx << 10) | (rn << 5) | rt_field)
        }
        Mem::RegOffset {
            index,
            shift,
            extend,
            ..
        } => {
            let rn = base_reg(mem)?;
            if shift != 0 && u32::from(shift) != form.elem.trailing_zeros() {
                return Err(EncodeError::InvalidImmediate);
            }
            let index_ok = match extend {
                MemExtend::Lsl | MemExtend::Sxtx => index.size() == 64,
                MemExtend::Uxtw | MemExtend::Sxtw => index.size() == 32,
            };
            if !index_ok {
                return Err(EncodeError::InvalidRegister);
            }
            let rm = gp_zr(index)?;
            let s = u32::from(shift != 0);
            Ok(group
                | (1 << 21)
                | (rm << 16)
                | (extend.bits() << 13)
                | (s << 12)
                | (0b10 << 10)
                | (rn << 5)
                | rt_field)
        }
        Mem::Literal { offset } => load_literal(tag, rt, rt_field, offset),
    }
}

fn load_literal(tag: Tag, rt: Reg, rt_field: u32, offset: i32) -> Word {
    if offset % 4 != 0 || !(-(1 << 20)..(1 << 20)).contains(&offset) {
        return Err(EncodeError::InvalidImmediate);
    }
    let (opc, v) = match (tag, rt) {
        (Tag::Ldr, Reg::X(_) | Reg::Xzr) => (0b01u32, 0u32),
        (Tag::Ldr, Reg::W(_) | Reg::Wzr) => (0b00, 0),
        (Tag::Ldrsw, Reg::X(_) | Reg::Xzr) => (0b10, 0),
        (Tag::Ldr, Reg::S(_)) => (0b00, 1),
        (Tag::Ldr, Reg::D(_)) => (0b01, 1),
        (Tag::Ldr, Reg::V(_)) => (0b10, 1),
        _ => return Err(EncodeError::InvalidOperands),
    };
    let imm19 = ((offset / 4) as u32) & 0x7ffff;
    Ok((opc << 30) | (0b011 << 27) | (v << 26) | (imm19 << 5) | rt_field)
}

fn load_store_pair(l: u32, rt: Reg, rt2: Reg, mem: Mem) -> Word {
    check_same_width(rt, rt2)?;
    let (opc, v, elem) = match (rt, rt2) {
        (Reg::X(_) | Reg::Xzr, Reg::X(_) | Reg::Xzr) => (0b10u32, 0u32, 8i32),
        (Reg::W(_) | Reg::Wzr, Reg::W(_) | Reg::Wzr) => (0b00, 0, 4),
        (Reg::D(_), Reg::D(_)) => (0b01, 1, 8),
        (Reg::S(_), Reg::S(_)) | (Reg::V(_), Reg::V(_)) => {
            return Err(EncodeError::UnimplementedInstruction)
        }
        _ => return Err(EncodeError::InvalidRegister),
    };
    let (mode, offset) = match mem {
        Mem::Offset { offset, .. } => (0b010u32, offset),
        Mem::PreIndex { offset, .. } => (0b011, offset),
        Mem::PostIndex { offset, .. } => (0b001, offset),
        _ => return Err(EncodeError::InvalidOperands),
    };
    if offset % elem != 0 {
        return Err(EncodeError::InvalidImmediate);
    }
    let scaled = offset / elem;
    if !(-64..=63).contains(&scaled) {
        return Err(EncodeError::InvalidImmediate);
    }
    let rn = base_reg(mem)?;
    let imm7 = (scaled as u32) & 0x7f;
    let rt_field = if v == 1 { rt.id() as u32 } else { gp_zr(rt)? };
    let rt2_field = if v == 1 { rt2.id() as u32 } else { gp_zr(rt2)? };
    Ok((opc << 30)
        | (0b101 << 27)
        | (v << 26)
        | (mode << 23)
        | (l << 22)
        | (imm7 << 15)
        | (rt2_field << 10)
        | (rn << 5)
        | rt_field)
}

// --- Floating point ------------------------------------------------------

/// The `ftype` field for a scalar FP register.
fn ftype(reg: Reg) -> Word {
    match reg {
        Reg::S(_) => Ok(0b00),
        Reg::D(_) => Ok(0b01),
        _ => Err(EncodeError::InvalidRegister),
    }
}

fn fp_two_source(opcode: u32, rd: Reg, rn: Reg, rm: Reg) -> Word {
    let ty = ftype(rd)?;
    check_same_width(rd, rn)?;
    check_same_width(rd, rm)?;
    ftype(rn)?;
    ftype(rm)?;
    Ok(0x1e20_0800
        | (ty << 22)
        | ((rm.id() as u32) << 16)
        | (opcode << 12)
        | ((rn.id() as u32) << 5)
        | rd.id() as u32)
}

fn fp_one_source(opcode: u32, rd: Reg, rn: Reg) -> Word {
    let ty = ftype(rd)?;
    check_same_width(rd, rn)?;
    ftype(rn)?;
    Ok(0x1e20_4000 | (ty << 22) | (opcode << 15) | ((rn.id() as u32) << 5) | rd.id() as u32)
}

fn fp_compare(rn: Reg, rm: Reg) -> Word {
    let ty = ftype(rn)?;
    check_same_width(rn, rm)?;
    ftype(rm)?;
    Ok(0x1e20_2000 | (ty << 22) | ((rm.id() as u32) << 16) | ((rn.id() as u32) << 5))
}

fn fmov(rd: Reg, rn: Reg) -> Word {
    match (rd, rn) {
        // Within the FP file.
        (Reg::D(_), Reg::D(_)) | (Reg::S(_), Reg::S(_)) => {
            let ty = ftype(rd)?;
            Ok(0x1e20_4000 | (ty << 22) | ((rn.id() as u32) << 5) | rd.id() as u32)
        }
        // Between the integer and FP files, same width only.
        (Reg::D(_), Reg::X(_) | Reg::Xzr) => transfer(0x9e67_0000, rd, rn),
        (Reg::X(_), Reg::D(_)) => transfer(0x9e66_0000, rd, rn),
        (Reg::S(_), Reg::W(_) | Reg::Wzr) => transfer(0x1e27_0000, rd, rn),
        (Reg::W(_), Reg::S(_)) => transfer(0x1e26_0000, rd, rn),
        _ => Err(EncodeError::InvalidRegister),
    }
}

fn transfer(base: u32, rd: Reg, rn: Reg) -> Word {
    Ok(base | ((rn.id() as u32) << 5) | rd.id() as u32)
}

fn fp_convert_precision(rd: Reg, rn: Reg) -> Word {
    match (rd, rn) {
        (Reg::D(_), Reg::S(_)) => transfer(0x1e22_c000, rd, rn),
        (Reg::S(_), Reg::D(_)) => transfer(0x1e62_4000, rd, rn),
        (Reg::H(_), Reg::S(_) | Reg::D(_)) | (Reg::S(_) | Reg::D(_), Reg::H(_)) => {
            Err(EncodeError::UnimplementedInstruction)
        }
        _ => Err(EncodeError::InvalidRegister),
    }
}

fn int_to_fp(opcode: u32, rd: Reg, rn: Reg) -> Word {
    let ty = ftype(rd)?;
    let sf = sf(rn)?;
    let rn = gp_zr(rn)?;
    Ok(sf | 0x1e20_0000 | (ty << 22) | (opcode << 16) | (rn << 5) | rd.id() as u32)
}

fn fp_to_int(opcode: u32, rd: Reg, rn: Reg) -> Word {
    let ty = ftype(rn)?;
    let sf = sf(rd)?;
    let rd = gp_zr(rd)?;
    Ok(sf | 0x1e38_0000 | (ty << 22) | (opcode << 16) | ((rn.id() as u32) << 5) | rd)
}

// --- PC-relative ---------------------------------------------------------

fn pc_rel(base: u32, rd: Reg, value: i64) -> Word {
    if rd.size() != 64 {
        return Err(EncodeError::InvalidRegister);
    }
    if !(-(1 << 20)..(1 << 20)).contains(&value) {
        return Err(EncodeError::InvalidImmediate);
    }
    let rd = gp_zr(rd)?;
    let immlo = ((value as u32) & 0b11) << 29;
    let immhi = (((value >> 2) as u32) & 0x7ffff) << 5;
    Ok(base | immlo | immhi | rd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{Data, Inst, Tag};

    #[test]
    fn wide_immediate_chunks() {
        assert_eq!(split_wide_immediate(0, 4), Ok((0, 0)));
        assert_eq!(split_wide_immediate(0xbeef, 4), Ok((0, 0xbeef)));
        assert_eq!(split_wide_immediate(0xbeef << 32, 4), Ok((2, 0xbeef)));
        assert_eq!(
            split_wide_immediate(0x1_0001, 4),
            Err(EncodeError::InvalidImmediate)
        );
        // The high chunks are unreachable for 32-bit destinations.
        assert_eq!(
            split_wide_immediate(0xbeef << 32, 2),
            Err(EncodeError::InvalidImmediate)
        );
    }

    #[test]
    fn bitfield_insert_formula() {
        // bfi x0, x1, #8, #4 is BFM with immr = 56, imms = 3.
        let inst = Inst::new(
            Tag::Bfm,
            Data::RrLsbWidth {
                rd: Reg::x(0),
                rn: Reg::x(1),
                lsb: 8,
                width: 4,
            },
        );
        assert_eq!(encode(&inst), Ok(0xb378_0c20));
    }

    #[test]
    fn ror_immediate_is_extr_with_equal_sources() {
        let inst = Inst::new(
            Tag::Ror,
            Data::Rri {
                rd: Reg::x(0),
                rn: Reg::x(1),
                imm: crate::bits::imm::Imm::Unsigned(4),
            },
        );
        assert_eq!(encode(&inst), Ok(0x93c1_1020));
    }

    #[test]
    fn zero_width_bitfields_are_rejected() {
        let inst = Inst::new(
            Tag::Ubfm,
            Data::RrLsbWidth {
                rd: Reg::x(0),
                rn: Reg::x(1),
                lsb: 8,
                width: 0,
            },
        );
        assert_eq!(encode(&inst), Err(EncodeError::InvalidImmediate));
    }
}
