//! ARM64 register file definitions.
//!
//! Registers are modeled as one value per architectural *view*: `x5`,
//! `w5`, and `d5` are three distinct [`Reg`] values even though two of
//! them name the same hardware register. [`Reg::id`] collapses a view to
//! its 5-bit hardware encoding; SP, XZR, and WZR all encode as 31 and the
//! opcode context disambiguates them.

use core::fmt;

/// The class a register belongs to. Every register is in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegClass {
    /// Integer registers x0-x30 / w0-w30 and the zero registers.
    GeneralPurpose,
    /// SIMD/FP registers in any of their five width views.
    Vector,
    /// The stack pointer.
    Special,
}

/// One view of one ARM64 register.
///
/// Indices are `0..=30` for the general-purpose views and `0..=31` for
/// the vector views; the checked constructors below are the intended way
/// to build values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reg {
    /// 64-bit general-purpose view xN.
    X(u8),
    /// 32-bit general-purpose view wN.
    W(u8),
    /// 64-bit zero register.
    Xzr,
    /// 32-bit zero register.
    Wzr,
    /// Stack pointer.
    Sp,
    /// 128-bit SIMD view vN.
    V(u8),
    /// 64-bit scalar FP view dN.
    D(u8),
    /// 32-bit scalar FP view sN.
    S(u8),
    /// 16-bit scalar FP view hN.
    H(u8),
    /// 8-bit scalar FP view bN.
    B(u8),
}

impl Reg {
    /// Frame pointer alias.
    pub const FP: Reg = Reg::X(29);
    /// Link register alias.
    pub const LR: Reg = Reg::X(30);

    /// Checked constructor for xN.
    pub const fn x(n: u8) -> Reg {
        assert!(n <= 30, "x register index out of range");
        Reg::X(n)
    }

    /// Checked constructor for wN.
    pub const fn w(n: u8) -> Reg {
        assert!(n <= 30, "w register index out of range");
        Reg::W(n)
    }

    /// Checked constructor for vN.
    pub const fn v(n: u8) -> Reg {
        assert!(n <= 31, "v register index out of range");
        Reg::V(n)
    }

    /// Checked constructor for dN.
    pub const fn d(n: u8) -> Reg {
        assert!(n <= 31, "d register index out of range");
        Reg::D(n)
    }

    /// Checked constructor for sN.
    pub const fn s(n: u8) -> Reg {
        assert!(n <= 31, "s register index out of range");
        Reg::S(n)
    }

    /// Checked constructor for hN.
    pub const fn h(n: u8) -> Reg {
        assert!(n <= 31, "h register index out of range");
        Reg::H(n)
    }

    /// Checked constructor for bN.
    pub const fn b(n: u8) -> Reg {
        assert!(n <= 31, "b register index out of range");
        Reg::B(n)
    }

    /// The 5-bit hardware encoding. SP, XZR, and WZR all encode as 31.
    pub const fn id(self) -> u8 {
        match self {
            Reg::X(n) | Reg::W(n) => n,
            Reg::Xzr | Reg::Wzr | Reg::Sp => 31,
            Reg::V(n) | Reg::D(n) | Reg::S(n) | Reg::H(n) | Reg::B(n) => n,
        }
    }

    /// The register class.
    pub const fn class(self) -> RegClass {
        match self {
            Reg::X(_) | Reg::W(_) | Reg::Xzr | Reg::Wzr => RegClass::GeneralPurpose,
            Reg::Sp => RegClass::Special,
            Reg::V(_) | Reg::D(_) | Reg::S(_) | Reg::H(_) | Reg::B(_) => RegClass::Vector,
        }
    }

    /// Operand width of this view in bits.
    pub const fn size(self) -> u16 {
        match self {
            Reg::X(_) | Reg::Xzr | Reg::Sp | Reg::D(_) => 64,
            Reg::W(_) | Reg::Wzr | Reg::S(_) => 32,
            Reg::V(_) => 128,
            Reg::H(_) => 16,
            Reg::B(_) => 8,
        }
    }

    /// Whether this is one of the SIMD/FP views.
    pub const fn is_vector(self) -> bool {
        matches!(self.class(), RegClass::Vector)
    }

    /// Whether this is a zero register.
    pub const fn is_zr(self) -> bool {
        matches!(self, Reg::Xzr | Reg::Wzr)
    }

    /// Whether this is the stack pointer.
    pub const fn is_sp(self) -> bool {
        matches!(self, Reg::Sp)
    }

    /// The 32-bit view of the same hardware register. SP and the scalar
    /// FP views below 32 bits map to themselves.
    pub const fn to32(self) -> Reg {
        match self {
            Reg::X(n) => Reg::W(n),
            Reg::Xzr => Reg::Wzr,
            Reg::V(n) | Reg::D(n) => Reg::S(n),
            other => other,
        }
    }

    /// The 64-bit view of the same hardware register. SP and the scalar
    /// FP views below 32 bits map to themselves.
    pub const fn to64(self) -> Reg {
        match self {
            Reg::W(n) => Reg::X(n),
            Reg::Wzr => Reg::Xzr,
            Reg::V(n) | Reg::S(n) => Reg::D(n),
            other => other,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::X(n) => write!(f, "x{n}"),
            Reg::W(n) => write!(f, "w{n}"),
            Reg::Xzr => write!(f, "xzr"),
            Reg::Wzr => write!(f, "wzr"),
            Reg::Sp => write!(f, "sp"),
            Reg::V(n) => write!(f, "v{n}"),
            Reg::D(n) => write!(f, "d{n}"),
            Reg::S(n) => write!(f, "s{n}"),
            Reg::H(n) => write!(f, "h{n}"),
            Reg::B(n) => write!(f, "b{n}"),
        }
    }
}

/// ARM64 system registers reachable through MRS/MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SysReg {
    /// Condition flags.
    Nzcv,
    /// Floating-point control register.
    Fpcr,
    /// Floating-point status register.
    Fpsr,
    /// EL0 software thread id register.
    TpidrEl0,
}

impl SysReg {
    /// The 15-bit `o0:op1:CRn:CRm:op2` system register field.
    pub const fn field(self) -> u32 {
        const fn field(o0: u32, op1: u32, crn: u32, crm: u32, op2: u32) -> u32 {
            (o0 << 14) | (op1 << 11) | (crn << 7) | (crm << 3) | op2
        }

        match self {
            SysReg::Nzcv => field(1, 3, 4, 2, 0),
            SysReg::Fpcr => field(1, 3, 4, 4, 0),
            SysReg::Fpsr => field(1, 3, 4, 4, 1),
            SysReg::TpidrEl0 => field(1, 3, 13, 0, 2),
        }
    }
}

impl fmt::Display for SysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SysReg::Nzcv => "nzcv",
            SysReg::Fpcr => "fpcr",
            SysReg::Fpsr => "fpsr",
            SysReg::TpidrEl0 => "tpidr_el0",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_round_trips() {
        for n in 0..=30 {
            assert_eq!(Reg::x(n).to32().to64(), Reg::x(n));
            assert_eq!(Reg::w(n).to64().to32(), Reg::w(n));
        }
        for n in 0..=31 {
            assert_eq!(Reg::d(n).to32().to64(), Reg::d(n));
            assert_eq!(Reg::s(n).to64().to32(), Reg::s(n));
        }
        assert_eq!(Reg::Xzr.to32(), Reg::Wzr);
        assert_eq!(Reg::Wzr.to64(), Reg::Xzr);
        assert_eq!(Reg::Sp.to32(), Reg::Sp);
        assert_eq!(Reg::Sp.to64(), Reg::Sp);
    }

    #[test]
    fn hardware_ids() {
        assert_eq!(Reg::Sp.id(), 31);
        assert_eq!(Reg::Xzr.id(), 31);
        assert_eq!(Reg::Wzr.id(), 31);
        assert_eq!(Reg::FP.id(), 29);
        assert_eq!(Reg::LR.id(), 30);
        assert_eq!(Reg::v(17).id(), 17);
    }

    #[test]
    fn classes_are_disjoint() {
        assert_eq!(Reg::x(0).class(), RegClass::GeneralPurpose);
        assert_eq!(Reg::Wzr.class(), RegClass::GeneralPurpose);
        assert_eq!(Reg::Sp.class(), RegClass::Special);
        assert_eq!(Reg::d(3).class(), RegClass::Vector);
    }

    #[test]
    fn display_uses_assembler_names() {
        assert_eq!(Reg::x(3).to_string(), "x3");
        assert_eq!(Reg::Sp.to_string(), "sp");
        assert_eq!(Reg::Wzr.to_string(), "wzr");
        assert_eq!(Reg::d(31).to_string(), "d31");
    }

    #[test]
    fn nzcv_field_matches_reference_encoding() {
        // MRS x0, nzcv assembles to 0xd53b4200.
        assert_eq!(0xd530_0000 | (SysReg::Nzcv.field() << 5), 0xd53b_4200);
    }
}
