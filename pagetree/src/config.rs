//! Tree configuration.
//!
//! The only tunable is the merge threshold used by deletion. Host stores can
//! build a [`TreeConfig`] directly, embed it in their own (serde) config, or
//! load it from the environment.
//!
//! # Environment Variables
//!
//! - `PAGETREE_MERGE_THRESHOLD`: encoded size in bytes below which a node is
//!   merged with or refilled from a sibling after a delete (default: `1024`)
//!
//! # Invariants
//!
//! - `merge_threshold <= PAGE_SIZE / 2`

use serde::{Deserialize, Serialize};

use crate::page::PAGE_SIZE;

/// Environment variable holding the merge threshold.
pub const MERGE_THRESHOLD_ENV: &str = "PAGETREE_MERGE_THRESHOLD";

/// Tree configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Nodes whose encoded size drops below this many bytes after a delete
    /// are merged with a sibling when the result fits in a page. Empty nodes
    /// are always merged regardless of this value.
    pub merge_threshold: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl TreeConfig {
    /// Default merge threshold: a quarter page.
    pub const DEFAULT_MERGE_THRESHOLD: usize = PAGE_SIZE / 4;

    /// Largest accepted merge threshold.
    pub const MAX_MERGE_THRESHOLD: usize = PAGE_SIZE / 2;

    /// Set the merge threshold.
    #[must_use]
    pub const fn with_merge_threshold(mut self, merge_threshold: usize) -> Self {
        self.merge_threshold = merge_threshold;
        self
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.merge_threshold > Self::MAX_MERGE_THRESHOLD {
            return Err(ConfigError::InvalidValue {
                name: "merge_threshold".to_string(),
                message: format!(
                    "{} exceeds the maximum of {}",
                    self.merge_threshold,
                    Self::MAX_MERGE_THRESHOLD
                ),
            });
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `PAGETREE_MERGE_THRESHOLD` is set but is not a
    /// number or exceeds [`Self::MAX_MERGE_THRESHOLD`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let merge_threshold = match lookup(MERGE_THRESHOLD_ENV) {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: MERGE_THRESHOLD_ENV.to_string(),
                    message: format!("'{value}' is not a byte count"),
                })?,
            None => Self::DEFAULT_MERGE_THRESHOLD,
        };

        let config = Self { merge_threshold };
        config.validate().map_err(|_| ConfigError::InvalidValue {
            name: MERGE_THRESHOLD_ENV.to_string(),
            message: format!(
                "{merge_threshold} exceeds the maximum of {}",
                Self::MAX_MERGE_THRESHOLD
            ),
        })?;
        Ok(config)
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            merge_threshold: Self::DEFAULT_MERGE_THRESHOLD,
        }
    }
}
