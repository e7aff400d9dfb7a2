//! Engine configuration
//!
//! Per-component config structs live next to their components; this module
//! aggregates them, loads TOML overrides, and validates the combinations
//! that must fail fast (zero score weight, zero embedding dimension).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arbiter::LlmConfig;
use crate::assignment::AssignmentConfig;
use crate::index::VectorIndexConfig;
use crate::insights::InsightConfig;
use crate::maintenance::MaintenanceConfig;
use crate::scoring::ScoreParameters;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Configuration error; fatal at startup
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("score weights sum to zero; at least one weight must be positive")]
    ZeroScoreWeights,
    #[error("embedding dimension must be positive")]
    ZeroDimension,
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Aggregated configuration for the event detection engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    pub scoring: ScoreParameters,
    pub index: VectorIndexConfig,
    pub assignment: AssignmentConfig,
    pub llm: LlmConfig,
    pub maintenance: MaintenanceConfig,
    pub insights: InsightConfig,
}

impl EngineConfig {
    /// Parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations the engine must not start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scoring.weight_sum() <= 0.0 {
            return Err(ConfigError::ZeroScoreWeights);
        }
        if self.index.dimension == 0 {
            return Err(ConfigError::ZeroDimension);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
