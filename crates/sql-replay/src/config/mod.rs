//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::validate_filters;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Overrides `source.password` when set.
pub const SOURCE_PASSWORD_ENV: &str = "SQL_REPLAY_SOURCE_PASSWORD";
/// Overrides `target.password` when set.
pub const TARGET_PASSWORD_ENV: &str = "SQL_REPLAY_TARGET_PASSWORD";

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string, apply environment overrides
    /// and validate.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for run provenance.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let (Some(source), Some(password)) = (self.source.as_mut(), lookup(SOURCE_PASSWORD_ENV))
        {
            source.password = password;
        }
        if let Some(password) = lookup(TARGET_PASSWORD_ENV) {
            self.target.password = password;
        }
    }
}
