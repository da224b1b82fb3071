//! Named, typed operator attributes

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// Read-only bag of operator attributes, e.g. `{axis: 1, right: true}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeBag {
    values: BTreeMap<String, AttrValue>,
}

impl AttributeBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// # Errors
    /// Returns [`Error::InvalidAttribute`] if missing or not an integer
    pub fn int(&self, name: &str) -> Result<i64> {
        match self.require(name)? {
            AttrValue::Int(v) => Ok(*v),
            other => Err(mistyped(name, "int", other)),
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidAttribute`] if present but not an integer
    pub fn int_or(&self, name: &str, default: i64) -> Result<i64> {
        if self.contains(name) {
            self.int(name)
        } else {
            Ok(default)
        }
    }

    /// Integers are accepted and widened.
    ///
    /// # Errors
    /// Returns [`Error::InvalidAttribute`] if missing or not numeric
    #[allow(clippy::cast_precision_loss)]
    pub fn float(&self, name: &str) -> Result<f64> {
        match self.require(name)? {
            AttrValue::Float(v) => Ok(*v),
            AttrValue::Int(v) => Ok(*v as f64),
            other => Err(mistyped(name, "float", other)),
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidAttribute`] if present but not numeric
    pub fn float_or(&self, name: &str, default: f64) -> Result<f64> {
        if self.contains(name) {
            self.float(name)
        } else {
            Ok(default)
        }
    }

    /// Integers 0 and 1 are accepted as booleans.
    ///
    /// # Errors
    /// Returns [`Error::InvalidAttribute`] if missing or not boolean
    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.require(name)? {
            AttrValue::Bool(v) => Ok(*v),
            AttrValue::Int(0) => Ok(false),
            AttrValue::Int(1) => Ok(true),
            other => Err(mistyped(name, "bool", other)),
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidAttribute`] if present but not boolean
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        if self.contains(name) {
            self.bool(name)
        } else {
            Ok(default)
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidAttribute`] if missing or not a string
    pub fn str(&self, name: &str) -> Result<&str> {
        match self.require(name)? {
            AttrValue::Str(v) => Ok(v),
            other => Err(mistyped(name, "string", other)),
        }
    }

    fn require(&self, name: &str) -> Result<&AttrValue> {
        self.values
            .get(name)
            .ok_or_else(|| Error::attribute(name, "missing"))
    }
}

fn mistyped(name: &str, expected: &str, got: &AttrValue) -> Error {
    Error::attribute(name, format!("expected {expected}, got {}", got.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let attrs = AttributeBag::new()
            .with("axis", 2)
            .with("right", true)
            .with("eps", 1e-5)
            .with("reduction", "add");
        assert_eq!(attrs.int("axis").unwrap(), 2);
        assert!(attrs.bool("right").unwrap());
        assert!((attrs.float("eps").unwrap() - 1e-5).abs() < 1e-12);
        assert_eq!(attrs.str("reduction").unwrap(), "add");
        assert!((attrs.float("axis").unwrap() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_and_mistyped() {
        let attrs = AttributeBag::new().with("axis", "zero");
        let err = attrs.int("axis").unwrap_err();
        assert_eq!(err.to_string(), "Invalid attribute `axis`: expected int, got string");
        let err = attrs.bool("right").unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute { ref reason, .. } if reason == "missing"));
    }

    #[test]
    fn test_defaults() {
        let attrs = AttributeBag::new().with("exclusive", 1);
        assert!(attrs.bool_or("exclusive", false).unwrap());
        assert!(!attrs.bool_or("reverse", false).unwrap());
        assert_eq!(attrs.int_or("axis", 0).unwrap(), 0);
        assert!(attrs.bool("exclusive").is_ok());
    }

    #[test]
    fn test_deserialize_untagged() {
        let attrs: AttributeBag =
            serde_json::from_str(r#"{"axis": -1, "right": false, "min_value": 0.5, "reduction": "mul"}"#)
                .unwrap();
        assert_eq!(attrs.int("axis").unwrap(), -1);
        assert!(!attrs.bool("right").unwrap());
        assert_eq!(attrs.str("reduction").unwrap(), "mul");
        assert_eq!(attrs.iter().count(), 4);
    }
}
