//! AAPCS64 classification of parameter and return types.
//!
//! This is a pure helper consumed by the upstream lowering when it
//! decides how an aggregate travels: in memory, by value in one or two
//! integer registers, or as a homogeneous floating-point aggregate in up
//! to four FP registers. Meta types (void, noreturn, opaque, ...) have
//! no representation here; callers must not classify them.

use itertools::Itertools;

/// Width of a floating-point type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FloatWidth {
    /// IEEE 754 half precision.
    F16,
    /// IEEE 754 single precision.
    F32,
    /// IEEE 754 double precision.
    F64,
    /// IEEE 754 quadruple precision.
    F128,
}

impl FloatWidth {
    /// The width in bits.
    pub const fn bits(self) -> u64 {
        match self {
            FloatWidth::F16 => 16,
            FloatWidth::F32 => 32,
            FloatWidth::F64 => 64,
            FloatWidth::F128 => 128,
        }
    }
}

/// The classifiable type model.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Ty {
    /// An integer of the given bit width.
    Int(u16),
    /// A boolean.
    Bool,
    /// An enum with the given tag width.
    Enum(u16),
    /// An error set; represented as a 16-bit code.
    ErrorSet,
    /// A floating-point number.
    Float(FloatWidth),
    /// A non-slice pointer.
    Pointer,
    /// An optional pointer with the null niche.
    OptionalPointer,
    /// A SIMD vector of the given total width.
    Vector {
        /// Total width in bits.
        bits: u32,
    },
    /// A struct.
    Struct {
        /// Whether the layout is packed.
        packed: bool,
        /// Field types, in declaration order.
        fields: Vec<Ty>,
    },
    /// A union.
    Union {
        /// Whether the layout is packed.
        packed: bool,
        /// Field types.
        fields: Vec<Ty>,
    },
}

/// AAPCS64 parameter/return classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Class {
    /// Passed indirectly through memory.
    Memory,
    /// A scalar passed as itself.
    Byval,
    /// An aggregate passed in one integer register.
    Integer,
    /// An aggregate passed in two integer registers.
    DoubleInteger,
    /// A homogeneous floating-point aggregate passed in `N` FP
    /// registers, `1 <= N <= 4`.
    FloatArray(u8),
}

impl Ty {
    /// The size of the type in bits, with natural field alignment.
    pub fn bit_size(&self) -> u64 {
        match self {
            Ty::Int(bits) | Ty::Enum(bits) => u64::from(*bits),
            Ty::Bool => 8,
            Ty::ErrorSet => 16,
            Ty::Float(w) => w.bits(),
            Ty::Pointer | Ty::OptionalPointer => 64,
            Ty::Vector { bits } => u64::from(*bits),
            Ty::Struct { packed: true, fields } => fields.iter().map(Ty::bit_size).sum(),
            Ty::Struct {
                packed: false,
                fields,
            } => {
                let mut offset = 0u64;
                let mut align = 8u64;
                for field in fields {
                    let field_align = field.alignment();
                    align = align.max(field_align);
                    offset = round_up(offset, field_align) + field.bit_size();
                }
                round_up(offset, align)
            }
            Ty::Union { packed, fields } => {
                let size = fields.iter().map(Ty::bit_size).max().unwrap_or(0);
                if *packed {
                    size
                } else {
                    let align = fields.iter().map(Ty::alignment).max().unwrap_or(8);
                    round_up(size, align)
                }
            }
        }
    }

    /// The natural alignment in bits, capped at 128.
    fn alignment(&self) -> u64 {
        match self {
            Ty::Struct { packed: true, .. } | Ty::Union { packed: true, .. } => 8,
            Ty::Struct { fields, .. } | Ty::Union { fields, .. } => {
                fields.iter().map(Ty::alignment).max().unwrap_or(8)
            }
            other => other.bit_size().next_power_of_two().clamp(8, 128),
        }
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Classifies `ty` for AAPCS64 parameter or return passing.
pub fn classify_type(ty: &Ty) -> Class {
    match ty {
        Ty::Int(_) | Ty::Bool | Ty::Enum(_) | Ty::ErrorSet | Ty::Float(_) => Class::Byval,
        Ty::Pointer | Ty::OptionalPointer => Class::Byval,
        Ty::Vector { bits } => {
            if *bits <= 128 {
                Class::Byval
            } else {
                Class::Memory
            }
        }
        Ty::Struct { packed: true, .. } | Ty::Union { packed: true, .. } => Class::Byval,
        Ty::Struct { .. } | Ty::Union { .. } => {
            if let Some((_, count)) = float_aggregate(ty) {
                return Class::FloatArray(count);
            }
            match ty.bit_size() {
                s if s > 128 => Class::Memory,
                s if s > 64 => Class::DoubleInteger,
                _ => Class::Integer,
            }
        }
    }
}

/// The uniform element type of a homogeneous floating-point aggregate,
/// or `None` if `ty` is not one.
pub fn float_array_elem(ty: &Ty) -> Option<FloatWidth> {
    match ty {
        Ty::Struct { packed: false, .. } | Ty::Union { packed: false, .. } => {
            float_aggregate(ty).map(|(width, _)| width)
        }
        _ => None,
    }
}

/// Recursively counts floats of a single uniform width. Bails out on a
/// non-float member, on mixed widths, or past four elements.
fn float_aggregate(ty: &Ty) -> Option<(FloatWidth, u8)> {
    let (width, count) = float_members(ty)?;
    (count >= 1 && count <= 4).then_some((width, count))
}

fn float_members(ty: &Ty) -> Option<(FloatWidth, u8)> {
    match ty {
        Ty::Float(w) => Some((*w, 1)),
        Ty::Struct {
            packed: false,
            fields,
        } => {
            let members = fields
                .iter()
                .map(float_members)
                .collect::<Option<Vec<_>>>()?;
            let width = uniform_width(&members)?;
            let count = members.iter().map(|(_, c)| u32::from(*c)).sum::<u32>();
            (count <= 4).then_some((width, count as u8))
        }
        Ty::Union {
            packed: false,
            fields,
        } => {
            let members = fields
                .iter()
                .map(float_members)
                .collect::<Option<Vec<_>>>()?;
            let width = uniform_width(&members)?;
            let count = members.iter().map(|(_, c)| *c).max()?;
            Some((width, count))
        }
        _ => None,
    }
}

fn uniform_width(members: &[(FloatWidth, u8)]) -> Option<FloatWidth> {
    if members.is_empty() {
        return None;
    }
    members
        .iter()
        .map(|(w, _)| *w)
        .all_equal()
        .then(|| members[0].0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::Arbitrary;

    fn f32_struct(n: usize) -> Ty {
        Ty::Struct {
            packed: false,
            fields: vec![Ty::Float(FloatWidth::F32); n],
        }
    }

    #[test]
    fn scalars_pass_by_value() {
        assert_eq!(classify_type(&Ty::Int(64)), Class::Byval);
        assert_eq!(classify_type(&Ty::Bool), Class::Byval);
        assert_eq!(classify_type(&Ty::Pointer), Class::Byval);
        assert_eq!(classify_type(&Ty::OptionalPointer), Class::Byval);
        assert_eq!(classify_type(&Ty::Float(FloatWidth::F64)), Class::Byval);
    }

    #[test]
    fn vectors_split_on_128_bits() {
        assert_eq!(classify_type(&Ty::Vector { bits: 128 }), Class::Byval);
        assert_eq!(classify_type(&Ty::Vector { bits: 256 }), Class::Memory);
    }

    #[test]
    fn homogeneous_float_aggregates() {
        assert_eq!(classify_type(&f32_struct(1)), Class::FloatArray(1));
        assert_eq!(classify_type(&f32_struct(3)), Class::FloatArray(3));
        assert_eq!(classify_type(&f32_struct(4)), Class::FloatArray(4));
        assert_eq!(
            float_array_elem(&f32_struct(3)),
            Some(FloatWidth::F32)
        );
    }

    #[test]
    fn five_floats_fall_back_to_size_rules() {
        // 5 x f32 = 160 bits > 128.
        assert_eq!(classify_type(&f32_struct(5)), Class::Memory);
        assert_eq!(float_array_elem(&f32_struct(5)), None);
    }

    #[test]
    fn mixed_float_widths_are_not_homogeneous() {
        let ty = Ty::Struct {
            packed: false,
            fields: vec![Ty::Float(FloatWidth::F32), Ty::Float(FloatWidth::F64)],
        };
        // f32 aligned to 32, f64 aligned to 64: 128 bits total.
        assert_eq!(classify_type(&ty), Class::DoubleInteger);
    }

    #[test]
    fn small_aggregates_take_integer_registers() {
        let ty = Ty::Struct {
            packed: false,
            fields: vec![Ty::Int(32), Ty::Int(16)],
        };
        assert_eq!(classify_type(&ty), Class::Integer);

        let ty = Ty::Struct {
            packed: false,
            fields: vec![Ty::Int(64), Ty::Int(32)],
        };
        assert_eq!(classify_type(&ty), Class::DoubleInteger);
    }

    #[test]
    fn packed_aggregates_pass_by_value() {
        let ty = Ty::Struct {
            packed: true,
            fields: vec![Ty::Int(7), Ty::Int(9)],
        };
        assert_eq!(classify_type(&ty), Class::Byval);
    }

    #[test]
    fn nested_aggregates_count_recursively() {
        let inner = f32_struct(2);
        let ty = Ty::Struct {
            packed: false,
            fields: vec![inner.clone(), inner],
        };
        assert_eq!(classify_type(&ty), Class::FloatArray(4));
    }

    #[test]
    fn unions_count_their_largest_variant() {
        let ty = Ty::Union {
            packed: false,
            fields: vec![f32_struct(2), Ty::Float(FloatWidth::F32)],
        };
        assert_eq!(classify_type(&ty), Class::FloatArray(2));
    }

    impl quickcheck::Arbitrary for Ty {
        fn arbitrary(g: &mut quickcheck::Gen) -> Ty {
            arbitrary_ty(g, 2)
        }
    }

    fn arbitrary_ty(g: &mut quickcheck::Gen, depth: u8) -> Ty {
        let variants = if depth == 0 { 7 } else { 9 };
        match u8::arbitrary(g) % variants {
            0 => Ty::Int(*g.choose(&[8u16, 16, 32, 64, 128]).unwrap()),
            1 => Ty::Bool,
            2 => Ty::Enum(*g.choose(&[8u16, 16, 32]).unwrap()),
            3 => Ty::ErrorSet,
            4 => Ty::Float(
                *g.choose(&[
                    FloatWidth::F16,
                    FloatWidth::F32,
                    FloatWidth::F64,
                    FloatWidth::F128,
                ])
                .unwrap(),
            ),
            5 => Ty::Pointer,
            6 => Ty::Vector {
                bits: *g.choose(&[64u32, 128, 256]).unwrap(),
            },
            7 => Ty::Struct {
                packed: bool::arbitrary(g),
                fields: arbitrary_fields(g, depth - 1),
            },
            _ => Ty::Union {
                packed: bool::arbitrary(g),
                fields: arbitrary_fields(g, depth - 1),
            },
        }
    }

    fn arbitrary_fields(g: &mut quickcheck::Gen, depth: u8) -> Vec<Ty> {
        let len = usize::arbitrary(g) % 5;
        (0..len).map(|_| arbitrary_ty(g, depth)).collect()
    }

    #[quickcheck_macros::quickcheck]
    fn classification_is_total_and_hfa_counts_are_bounded(ty: Ty) -> bool {
        match classify_type(&ty) {
            Class::FloatArray(n) => (1..=4).contains(&n),
            _ => true,
        }
    }
}
