//! Parameter schemas declared by kernel variants.
//!
//! Schemas are `'static` slices written next to the family that owns them,
//! so every variant sharing a kernel signature shares one schema.

use std::fmt;

use serde::Serialize;

/// Numeric type of a scalar kernel parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    I32,
    U32,
    F32,
}

/// A typed scalar value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ScalarValue {
    I32(i32),
    U32(u32),
    F32(f32),
}

impl ScalarValue {
    #[must_use]
    pub const fn scalar_type(self) -> ScalarType {
        match self {
            Self::I32(_) => ScalarType::I32,
            Self::U32(_) => ScalarType::U32,
            Self::F32(_) => ScalarType::F32,
        }
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u32> for ScalarValue {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<f32> for ScalarValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::I32(i32::from(v))
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{v}i32"),
            Self::U32(v) => write!(f, "{v}u32"),
            Self::F32(v) => write!(f, "{v}f32"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamRole {
    Input,
    Output,
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParamKind {
    Tensor,
    Scalar(ScalarType),
}

/// One entry of a kernel's parameter list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamDef {
    pub name: &'static str,
    pub role: ParamRole,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamDef {
    #[must_use]
    pub const fn input(name: &'static str) -> Self {
        Self {
            name,
            role: ParamRole::Input,
            kind: ParamKind::Tensor,
            required: true,
        }
    }

    #[must_use]
    pub const fn output(name: &'static str) -> Self {
        Self {
            name,
            role: ParamRole::Output,
            kind: ParamKind::Tensor,
            required: true,
        }
    }

    #[must_use]
    pub const fn scalar(name: &'static str, ty: ScalarType) -> Self {
        Self {
            name,
            role: ParamRole::Scalar,
            kind: ParamKind::Scalar(ty),
            required: true,
        }
    }

    /// Mark the parameter optional; the binder emits an absent slot when no
    /// value is supplied.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Ordered parameter list of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParameterSchema(&'static [ParamDef]);

impl ParameterSchema {
    #[must_use]
    pub const fn new(params: &'static [ParamDef]) -> Self {
        Self(params)
    }

    #[must_use]
    pub const fn params(&self) -> &'static [ParamDef] {
        self.0
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Count of parameters with the given role
    #[must_use]
    pub fn count(&self, role: ParamRole) -> usize {
        self.0.iter().filter(|p| p.role == role).count()
    }

    /// Structural sanity: unique names, role matches kind.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.iter().enumerate().all(|(i, p)| {
            let kind_ok = matches!(
                (p.role, p.kind),
                (ParamRole::Input | ParamRole::Output, ParamKind::Tensor)
                    | (ParamRole::Scalar, ParamKind::Scalar(_))
            );
            kind_ok && !self.0[..i].iter().any(|q| q.name == p.name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: ParameterSchema = ParameterSchema::new(&[
        ParamDef::input("input"),
        ParamDef::output("output"),
        ParamDef::scalar("min_value", ScalarType::F32),
        ParamDef::scalar("max_value", ScalarType::F32).optional(),
    ]);

    #[test]
    fn test_schema_counts() {
        assert_eq!(SCHEMA.len(), 4);
        assert_eq!(SCHEMA.count(ParamRole::Input), 1);
        assert_eq!(SCHEMA.count(ParamRole::Scalar), 2);
        assert!(!SCHEMA.params()[3].required);
        assert!(SCHEMA.is_well_formed());
    }

    #[test]
    fn test_malformed_schema() {
        const DUP: ParameterSchema =
            ParameterSchema::new(&[ParamDef::input("x"), ParamDef::output("x")]);
        assert!(!DUP.is_well_formed());

        const BAD_KIND: ParameterSchema = ParameterSchema::new(&[ParamDef {
            name: "x",
            role: ParamRole::Scalar,
            kind: ParamKind::Tensor,
            required: true,
        }]);
        assert!(!BAD_KIND.is_well_formed());
    }

    #[test]
    fn test_scalar_value_conversions() {
        assert_eq!(ScalarValue::from(true), ScalarValue::I32(1));
        assert_eq!(ScalarValue::from(3u32).scalar_type(), ScalarType::U32);
        assert_eq!(ScalarValue::from(0.5f32).to_string(), "0.5f32");
    }
}
