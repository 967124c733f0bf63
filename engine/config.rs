use crate::batch::BatchOptions;
use crate::predictor::PredictorOptions;
use crate::schema::DEFAULT_TARGET_COLUMN;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

pub const DEFAULT_TOP_FEATURES: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine settings, read from a TOML file. Every field has a default, so an
/// empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model_path: String,
    pub reference_path: String,
    pub target_column: String,
    /// Number of ranked features included in a response.
    pub top_features: usize,
    /// Start even when some reference medians are undefined; records that
    /// need those features then fail individually.
    pub allow_missing_statistics: bool,
    pub batch: BatchOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: "model.toml".to_string(),
            reference_path: "reference.csv".to_string(),
            target_column: DEFAULT_TARGET_COLUMN.to_string(),
            top_features: DEFAULT_TOP_FEATURES,
            allow_missing_statistics: false,
            batch: BatchOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        log::debug!("Loaded configuration from '{path}'");
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_path.trim().is_empty() {
            return Err(ConfigError::Invalid("model_path must not be empty".into()));
        }
        if self.reference_path.trim().is_empty() {
            return Err(ConfigError::Invalid("reference_path must not be empty".into()));
        }
        if self.target_column.trim().is_empty() {
            return Err(ConfigError::Invalid("target_column must not be empty".into()));
        }
        if self.batch.max_records == Some(0) {
            return Err(ConfigError::Invalid("batch.max_records must be at least 1".into()));
        }
        Ok(())
    }

    pub fn predictor_options(&self) -> PredictorOptions {
        PredictorOptions {
            top_features: self.top_features,
            allow_missing_statistics: self.allow_missing_statistics,
        }
    }
}
