//! Resolver configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::registry::DEFAULT_HASHED_LOOKUP_THRESHOLD;

/// Vector-instruction capability of the target device.
///
/// Folded into keys of capability-specific families as a flag field, so a
/// variant built for one level is never selected for another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Portable kernels only
    None,
    Evis1,
    #[default]
    Evis2,
}

impl Capability {
    /// Value of the `caps` key field
    #[must_use]
    pub const fn flag(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Evis1 => 1,
            Self::Evis2 => 2,
        }
    }
}

/// Configuration for a [`Resolver`](crate::Resolver)
///
/// Parsed from a JSON file; every field is optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Largest extent an image axis may address
    #[serde(default = "default_max_image_width")]
    pub max_image_width: usize,

    /// Families with more variants than this get a hashed index
    #[serde(default = "default_hashed_lookup_threshold")]
    pub hashed_lookup_threshold: usize,

    #[serde(default)]
    pub capability: Capability,
}

fn default_max_image_width() -> usize {
    65536
}

fn default_hashed_lookup_threshold() -> usize {
    DEFAULT_HASHED_LOOKUP_THRESHOLD
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_image_width: default_max_image_width(),
            hashed_lookup_threshold: default_hashed_lookup_threshold(),
            capability: Capability::default(),
        }
    }
}

impl ResolverConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }
}
