use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::combine::ConfidenceWeights;
use crate::coordinator::CoordinatorConfig;
use crate::error::{BullpenError, Result};
use crate::registry::RegistryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BullpenConfig {
    pub registry: RegistryConfig,
    pub coordinator: CoordinatorConfig,
    pub weights: ConfidenceWeights,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,bullpen=debug".to_string()
}

impl BullpenConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory and validate it
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config: Self = Self::builder(config_dir.as_ref())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn builder(
        config_dir: &Path,
    ) -> std::result::Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError>
    {
        let env = std::env::var("BULLPEN_ENV").unwrap_or_else(|_| "development".to_string());

        Ok(Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(File::from(config_dir.join(env)).required(false))
            // Override with environment variables (BULLPEN_REGISTRY__NAMESPACE, etc.)
            .add_source(
                Environment::with_prefix("BULLPEN")
                    .separator("__")
                    .try_parsing(true),
            ))
    }

    /// Every violated constraint, across all sections
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = self.registry.validation_errors();
        errors.extend(self.coordinator.validation_errors());
        errors.extend(self.weights.validation_errors());
        if self.logging.level.trim().is_empty() {
            errors.push("logging.level must not be empty".to_string());
        }
        errors
    }

    pub fn validate(&self) -> Result<()> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BullpenError::InvalidConfig(errors))
        }
    }
}
