//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::{EngineConfig, ModelTier};

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid parallelism: {0}. Must be between 1 and 64")]
    InvalidParallelism(usize),

    #[error("Invalid maxAttempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error("Invalid opusBudgetPercent: {0}. Must be in 0..=100")]
    InvalidOpusBudget(f64),

    #[error("startingTier {starting} exceeds maxTier {max}")]
    TierOrderInverted { starting: String, max: String },

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid chunk sizes: min {min} must be below target {target}")]
    InvalidChunkSizes { min: usize, target: usize },

    #[error("Search weights must be non-negative and not both zero")]
    InvalidSearchWeights,
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.undercity/config.yaml` (project config)
    /// 3. `.undercity/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`UNDERCITY_*` prefix)
    pub fn load() -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(".undercity/config.yaml"))
            .merge(Yaml::file(".undercity/local.yaml"))
            .merge(Env::prefixed("UNDERCITY_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file (plus defaults).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
        let grind = &config.grind;

        if grind.parallelism == 0 || grind.parallelism > 64 {
            return Err(ConfigError::InvalidParallelism(grind.parallelism));
        }
        if grind.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(grind.max_attempts));
        }
        if !(0.0..=100.0).contains(&grind.opus_budget_percent) {
            return Err(ConfigError::InvalidOpusBudget(grind.opus_budget_percent));
        }
        if grind.starting_tier > grind.max_tier {
            return Err(ConfigError::TierOrderInverted {
                starting: grind.starting_tier.to_string(),
                max: grind.max_tier.to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.index.chunk_min_tokens >= config.index.chunk_target_tokens {
            return Err(ConfigError::InvalidChunkSizes {
                min: config.index.chunk_min_tokens,
                target: config.index.chunk_target_tokens,
            });
        }
        if config.index.vector_weight < 0.0
            || config.index.fts_weight < 0.0
            || (config.index.vector_weight == 0.0 && config.index.fts_weight == 0.0)
        {
            return Err(ConfigError::InvalidSearchWeights);
        }

        Ok(())
    }
}

/// Parse a tier string for CLI flags.
pub fn parse_tier(s: &str) -> Result<ModelTier, String> {
    ModelTier::from_str(s).ok_or_else(|| format!("unknown tier '{s}', expected T0, T1, or T2"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::EngineConfig;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = EngineConfig::default();
        config.grind.parallelism = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidParallelism(0))
        ));
    }

    #[test]
    fn test_inverted_tier_order_rejected() {
        let mut config = EngineConfig::default();
        config.grind.starting_tier = ModelTier::T2;
        config.grind.max_tier = ModelTier::T1;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::TierOrderInverted { .. })
        ));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = EngineConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_chunk_sizes_validated() {
        let mut config = EngineConfig::default();
        config.index.chunk_min_tokens = 600;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidChunkSizes { .. })
        ));
    }

    #[test]
    fn test_parse_tier() {
        assert_eq!(parse_tier("t1").unwrap(), ModelTier::T1);
        assert!(parse_tier("t9").is_err());
    }
}
