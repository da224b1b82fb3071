//! Type classification: folding concrete dtypes into matching classes.
//!
//! Each family declares a [`FoldingTable`] at registration time. Types the
//! table does not accept classify to [`TypeClass::Unsupported`], which never
//! appears in a registered key, so lookup fails downstream instead of here.

use std::fmt;

use crate::dtype::DType;

/// Canonical element class used for variant matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeClass {
    I4,
    U4,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    BF16,
    F32,
    F64,
    Bool8,
    /// Sentinel for types a family does not accept
    Unsupported,
}

impl TypeClass {
    /// Bits needed to hold any class code
    pub const BITS: u32 = 4;

    /// Numeric code packed into signature keys
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::I4 => 0,
            Self::U4 => 1,
            Self::I8 => 2,
            Self::U8 => 3,
            Self::I16 => 4,
            Self::U16 => 5,
            Self::I32 => 6,
            Self::U32 => 7,
            Self::I64 => 8,
            Self::U64 => 9,
            Self::F16 => 10,
            Self::BF16 => 11,
            Self::F32 => 12,
            Self::F64 => 13,
            Self::Bool8 => 14,
            Self::Unsupported => 15,
        }
    }

    /// The concrete dtype this class is named after, if any
    #[must_use]
    pub const fn dtype(self) -> Option<DType> {
        Some(match self {
            Self::I4 => DType::I4,
            Self::U4 => DType::U4,
            Self::I8 => DType::I8,
            Self::U8 => DType::U8,
            Self::I16 => DType::I16,
            Self::U16 => DType::U16,
            Self::I32 => DType::I32,
            Self::U32 => DType::U32,
            Self::I64 => DType::I64,
            Self::U64 => DType::U64,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
            Self::Bool8 => DType::Bool8,
            Self::Unsupported => return None,
        })
    }

    /// Uppercase tag used in kernel names
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self.dtype() {
            Some(dtype) => dtype.tag(),
            None => "UNSUPPORTED",
        }
    }
}

impl From<DType> for TypeClass {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::I4 => Self::I4,
            DType::U4 => Self::U4,
            DType::I8 => Self::I8,
            DType::U8 => Self::U8,
            DType::I16 => Self::I16,
            DType::U16 => Self::U16,
            DType::I32 => Self::I32,
            DType::U32 => Self::U32,
            DType::I64 => Self::I64,
            DType::U64 => Self::U64,
            DType::F16 => Self::F16,
            DType::BF16 => Self::BF16,
            DType::F32 => Self::F32,
            DType::F64 => Self::F64,
            DType::Bool8 => Self::Bool8,
        }
    }
}

impl fmt::Display for TypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Per-family dtype folding rules.
///
/// ```
/// use vxplan::{DType, FoldingTable, TypeClass};
///
/// let table = FoldingTable::closed(&[DType::F32, DType::U8]).fold(DType::F16, DType::F32);
/// assert_eq!(table.classify(DType::F16), TypeClass::F32);
/// assert_eq!(table.classify(DType::I64), TypeClass::Unsupported);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldingTable {
    rules: Vec<(DType, TypeClass)>,
    passthrough: bool,
}

impl FoldingTable {
    /// Every dtype classifies to its own class unless folded
    #[must_use]
    pub fn identity() -> Self {
        Self {
            rules: Vec::new(),
            passthrough: true,
        }
    }

    /// Only the listed dtypes (and later folds) are accepted
    #[must_use]
    pub fn closed(accepted: &[DType]) -> Self {
        Self {
            rules: accepted.iter().map(|&d| (d, TypeClass::from(d))).collect(),
            passthrough: false,
        }
    }

    /// Fold `from` into the class of `to`. A later fold replaces an earlier
    /// rule for the same dtype.
    #[must_use]
    pub fn fold(mut self, from: DType, to: DType) -> Self {
        self.rules.retain(|(d, _)| *d != from);
        self.rules.push((from, TypeClass::from(to)));
        self
    }

    /// Fold several dtypes into one class
    #[must_use]
    pub fn fold_all(self, from: &[DType], to: DType) -> Self {
        from.iter().fold(self, |table, &d| table.fold(d, to))
    }

    /// Classify a concrete dtype. Total: never fails.
    #[must_use]
    pub fn classify(&self, dtype: DType) -> TypeClass {
        match self.rules.iter().find(|(d, _)| *d == dtype) {
            Some(&(_, class)) => class,
            None if self.passthrough => TypeClass::from(dtype),
            None => TypeClass::Unsupported,
        }
    }

    /// A concrete dtype that classifies to `class`, preferring the dtype the
    /// class is named after.
    #[must_use]
    pub fn representative(&self, class: TypeClass) -> Option<DType> {
        if let Some(dtype) = class.dtype() {
            if self.classify(dtype) == class {
                return Some(dtype);
            }
        }
        DType::ALL.into_iter().find(|&d| self.classify(d) == class)
    }
}

impl Default for FoldingTable {
    fn default() -> Self {
        Self::identity()
    }
}
