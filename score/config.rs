use crate::index::DEFAULT_CAPACITY_HINT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Tuning knobs for one clustering run. Every field has a default, so an empty TOML
/// file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Size of the scoring pool.
    pub workers: usize,
    /// Capacity of the bounded queue between the dispatcher and the workers.
    pub queue_bound: usize,
    /// A token space whose mean block density falls below this is frozen sparse.
    pub sparse_density: f64,
    /// Pairs sharing fewer called genes than this are left unreachable.
    pub min_matching_genes: u32,
    /// Completed scores folded into one progress event. The default of 1 reports
    /// every pair on its own.
    pub progress_batch: usize,
    /// Minimum token capacity reserved for each allele bit-set.
    pub allele_capacity_hint: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_bound: 50,
            sparse_density: 0.5,
            min_matching_genes: 0,
            progress_batch: 1,
            allele_capacity_hint: DEFAULT_CAPACITY_HINT,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    #[error("`sparse_density` must lie in [0, 1], found {0}")]
    Density(f64),
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("workers", self.workers),
            ("queue_bound", self.queue_bound),
            ("progress_batch", self.progress_batch),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if !(0.0..=1.0).contains(&self.sparse_density) {
            return Err(ConfigError::Density(self.sparse_density));
        }
        Ok(())
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
