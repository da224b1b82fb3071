//! Concrete element types of tensors seen by the resolver

use std::fmt;

use serde::{Deserialize, Serialize};

/// Concrete element types a tensor handle can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 4-bit signed integer (packed)
    I4,
    /// 4-bit unsigned integer (packed)
    U4,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    F32,
    F64,
    /// Boolean stored in one byte
    Bool8,
}

impl DType {
    /// Every concrete dtype, in declaration order
    pub const ALL: [Self; 15] = [
        Self::I4,
        Self::U4,
        Self::I8,
        Self::U8,
        Self::I16,
        Self::U16,
        Self::I32,
        Self::U32,
        Self::I64,
        Self::U64,
        Self::F16,
        Self::BF16,
        Self::F32,
        Self::F64,
        Self::Bool8,
    ];

    /// Storage width in bits
    #[must_use]
    pub const fn bits(self) -> usize {
        match self {
            Self::I4 | Self::U4 => 4,
            Self::I8 | Self::U8 | Self::Bool8 => 8,
            Self::I16 | Self::U16 | Self::F16 | Self::BF16 => 16,
            Self::I32 | Self::U32 | Self::F32 => 32,
            Self::I64 | Self::U64 | Self::F64 => 64,
        }
    }

    /// Size of one element in bytes, rounded up for sub-byte types
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        self.bits().div_ceil(8)
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    #[must_use]
    pub const fn is_signed_integer(self) -> bool {
        matches!(self, Self::I4 | Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Uppercase tag used when composing kernel names, e.g. `F32`, `U8`
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::I4 => "I4",
            Self::U4 => "U4",
            Self::I8 => "I8",
            Self::U8 => "U8",
            Self::I16 => "I16",
            Self::U16 => "U16",
            Self::I32 => "I32",
            Self::U32 => "U32",
            Self::I64 => "I64",
            Self::U64 => "U64",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::Bool8 => "BOOL8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I4 => "i4",
            Self::U4 => "u4",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bool8 => "bool8",
        };
        f.write_str(s)
    }
}

/// Host types whose bit pattern can be packed into kernel constants
pub trait ScalarElement: Copy + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;

    /// Raw storage bits, zero-extended to 32 bits
    fn to_bits_u32(self) -> u32;
}

impl ScalarElement for u8 {
    const DTYPE: DType = DType::U8;

    fn to_bits_u32(self) -> u32 {
        u32::from(self)
    }
}

impl ScalarElement for i8 {
    const DTYPE: DType = DType::I8;

    fn to_bits_u32(self) -> u32 {
        u32::from(self.to_ne_bytes()[0])
    }
}

impl ScalarElement for half::f16 {
    const DTYPE: DType = DType::F16;

    fn to_bits_u32(self) -> u32 {
        u32::from(self.to_bits())
    }
}

impl ScalarElement for half::bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_bits_u32(self) -> u32 {
        u32::from(self.to_bits())
    }
}

impl ScalarElement for f32 {
    const DTYPE: DType = DType::F32;

    fn to_bits_u32(self) -> u32 {
        self.to_bits()
    }
}

/// Replicate one element across a 128-bit constant register.
///
/// Narrow elements are repeated within each 32-bit lane, so a `u8` fills
/// four bytes per lane and an `f16` fills two halves per lane.
#[must_use]
pub fn splat_packed<T: ScalarElement>(value: T) -> [u32; 4] {
    let bits = T::DTYPE.bits();
    let raw = value.to_bits_u32();
    let mut lane = 0u32;
    let mut filled = 0;
    while filled < 32 {
        lane |= raw << filled;
        filled += bits;
    }
    [lane; 4]
}
