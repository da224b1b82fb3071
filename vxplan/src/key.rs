//! Signature keys: bit-packed type classes and layout flags.
//!
//! A [`KeyLayout`] is fixed per family when the family is registered. The
//! layout is validated on construction (no overlapping fields, class fields
//! wide enough for every [`TypeClass`] code) and [`KeyLayout::pack`] refuses
//! flag values that do not fit their field, so an out-of-range flag can never
//! alias another variant's key.

use std::fmt;

use crate::classify::TypeClass;
use crate::error::{Error, Result};

/// Packed signature identifying a variant within one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignatureKey(u64);

impl SignatureKey {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Holds a [`TypeClass`] code for one tensor role
    Class,
    /// Holds a small-integer layout or attribute flag
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    pub name: &'static str,
    pub kind: FieldKind,
    pub offset: u32,
    pub width: u32,
}

impl KeyField {
    /// Largest value the field can hold
    #[must_use]
    pub const fn max_value(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    const fn mask(&self) -> u64 {
        self.max_value() << self.offset
    }
}

/// Why a set of values could not be packed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    /// Wrong number of classes or flags for this layout
    Arity {
        expected_classes: usize,
        expected_flags: usize,
        got_classes: usize,
        got_flags: usize,
    },
    /// A value does not fit its field
    Overflow { field: &'static str, value: u64 },
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arity {
                expected_classes,
                expected_flags,
                got_classes,
                got_flags,
            } => write!(
                f,
                "expected {expected_classes} classes and {expected_flags} flags, got {got_classes} and {got_flags}"
            ),
            Self::Overflow { field, value } => {
                write!(f, "value {value} overflows key field `{field}`")
            }
        }
    }
}

/// Field layout of one family's signature keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    fields: Vec<KeyField>,
}

impl KeyLayout {
    #[must_use]
    pub fn builder() -> KeyLayoutBuilder {
        KeyLayoutBuilder::default()
    }

    #[must_use]
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn class_fields(&self) -> impl Iterator<Item = &KeyField> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Class)
    }

    pub fn flag_fields(&self) -> impl Iterator<Item = &KeyField> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Flag)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&KeyField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Pack one class per class field and one value per flag field, each in
    /// declaration order.
    ///
    /// # Errors
    /// Returns [`PackError::Arity`] if the counts do not match the layout and
    /// [`PackError::Overflow`] if a flag does not fit its field.
    pub fn pack(&self, classes: &[TypeClass], flags: &[u32]) -> std::result::Result<SignatureKey, PackError> {
        let expected_classes = self.class_fields().count();
        let expected_flags = self.flag_fields().count();
        if classes.len() != expected_classes || flags.len() != expected_flags {
            return Err(PackError::Arity {
                expected_classes,
                expected_flags,
                got_classes: classes.len(),
                got_flags: flags.len(),
            });
        }

        let mut key = 0u64;
        let values = classes
            .iter()
            .map(|c| u64::from(c.code()))
            .zip(self.class_fields())
            .chain(flags.iter().map(|&f| u64::from(f)).zip(self.flag_fields()));
        for (value, field) in values {
            if value > field.max_value() {
                return Err(PackError::Overflow {
                    field: field.name,
                    value,
                });
            }
            key |= value << field.offset;
        }
        log::trace!("packed {classes:?} {flags:?} -> {key:#x}");
        Ok(SignatureKey(key))
    }

    /// Extract the value of a named field from a key
    #[must_use]
    pub fn extract(&self, key: SignatureKey, name: &str) -> Option<u64> {
        self.field(name)
            .map(|f| (key.0 & f.mask()) >> f.offset)
    }
}

/// Builder assigning field offsets from the least significant bit upwards,
/// unless an explicit offset is given.
#[derive(Debug, Default)]
pub struct KeyLayoutBuilder {
    fields: Vec<KeyField>,
    next_offset: u32,
}

impl KeyLayoutBuilder {
    /// Append a class field of [`TypeClass::BITS`] bits
    #[must_use]
    pub fn class(self, name: &'static str) -> Self {
        let offset = self.next_offset;
        self.class_at(name, offset, TypeClass::BITS)
    }

    /// Class field at an explicit offset and width
    #[must_use]
    pub fn class_at(self, name: &'static str, offset: u32, width: u32) -> Self {
        self.push(name, FieldKind::Class, offset, width)
    }

    /// Append a flag field of `width` bits
    #[must_use]
    pub fn flag(self, name: &'static str, width: u32) -> Self {
        let offset = self.next_offset;
        self.flag_at(name, offset, width)
    }

    #[must_use]
    pub fn flag_at(self, name: &'static str, offset: u32, width: u32) -> Self {
        self.push(name, FieldKind::Flag, offset, width)
    }

    fn push(mut self, name: &'static str, kind: FieldKind, offset: u32, width: u32) -> Self {
        self.fields.push(KeyField {
            name,
            kind,
            offset,
            width,
        });
        self.next_offset = self.next_offset.max(offset.saturating_add(width));
        self
    }

    /// Validate and freeze the layout.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] for zero-width, overlapping, duplicate or
    /// out-of-range fields, and for class fields narrower than
    /// [`TypeClass::BITS`].
    pub fn build(self) -> Result<KeyLayout> {
        let mut used = 0u64;
        for (i, field) in self.fields.iter().enumerate() {
            if field.width == 0 {
                return Err(Error::internal(format!("key field `{}` has zero width", field.name)));
            }
            if field.offset + field.width > 64 {
                return Err(Error::internal(format!(
                    "key field `{}` ends at bit {}, past 64",
                    field.name,
                    field.offset + field.width
                )));
            }
            if field.kind == FieldKind::Class && field.width < TypeClass::BITS {
                return Err(Error::internal(format!(
                    "class field `{}` is {} bits wide, needs {}",
                    field.name,
                    field.width,
                    TypeClass::BITS
                )));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::internal(format!("duplicate key field `{}`", field.name)));
            }
            if used & field.mask() != 0 {
                return Err(Error::internal(format!("key field `{}` overlaps another field", field.name)));
            }
            used |= field.mask();
        }
        Ok(KeyLayout {
            fields: self.fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip_layout() -> KeyLayout {
        KeyLayout::builder()
            .flag("image_2d", 1)
            .class_at("out", 8, 8)
            .class_at("in", 20, 8)
            .build()
            .unwrap()
    }

    #[test]
    fn test_pack_matches_manual_shifts() {
        let layout = clip_layout();
        let key = layout.pack(&[TypeClass::U8, TypeClass::F32], &[1]).unwrap();
        let expected = (u64::from(TypeClass::U8.code()) << 20)
            | (u64::from(TypeClass::F32.code()) << 8)
            | 1;
        assert_eq!(key.raw(), expected);
        assert_eq!(layout.extract(key, "in"), Some(u64::from(TypeClass::U8.code())));
        assert_eq!(layout.extract(key, "image_2d"), Some(1));
        assert_eq!(layout.extract(key, "missing"), None);
    }

    #[test]
    fn test_pack_is_deterministic_and_injective_on_small_domain() {
        let layout = KeyLayout::builder().class("a").class("b").flag("f", 2).build().unwrap();
        let classes = [TypeClass::F32, TypeClass::U8, TypeClass::I32, TypeClass::BF16];
        let mut keys = Vec::new();
        for a in classes {
            for b in classes {
                for f in 0..4 {
                    let k1 = layout.pack(&[a, b], &[f]).unwrap();
                    let k2 = layout.pack(&[a, b], &[f]).unwrap();
                    assert_eq!(k1, k2);
                    keys.push(k1);
                }
            }
        }
        let n = keys.len();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), n);
    }

    #[test]
    fn test_flag_overflow_is_refused() {
        let layout = KeyLayout::builder().class("in").flag("axis", 2).build().unwrap();
        let err = layout.pack(&[TypeClass::F32], &[4]).unwrap_err();
        assert_eq!(err, PackError::Overflow { field: "axis", value: 4 });
    }

    #[test]
    fn test_arity_mismatch() {
        let layout = clip_layout();
        let err = layout.pack(&[TypeClass::F32], &[0]).unwrap_err();
        assert!(matches!(err, PackError::Arity { expected_classes: 2, got_classes: 1, .. }));
    }

    #[test]
    fn test_overlapping_fields_rejected() {
        let err = KeyLayout::builder()
            .class_at("in", 0, 8)
            .flag_at("image_2d", 4, 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_narrow_class_field_rejected() {
        let err = KeyLayout::builder().class_at("in", 0, 3).build().unwrap_err();
        assert!(err.to_string().contains("needs 4"));
    }

    #[test]
    fn test_field_past_64_bits_rejected() {
        assert!(KeyLayout::builder().flag_at("x", 60, 8).build().is_err());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        assert!(KeyLayout::builder().class("in").class("in").build().is_err());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SignatureKey::from_raw(0x1c).to_string(), "0x0000001c");
    }
}
