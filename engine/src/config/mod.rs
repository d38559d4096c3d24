//! Engine configuration.
//!
//! Execution limits, result-cache sizing and optimizer pass toggles. The
//! values are plain data; loading them from the environment is the job of
//! the binary that embeds the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

/// Upper bound accepted for `default_timeout_ms` (10 minutes).
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Upper bound accepted for `default_max_rows`.
pub const MAX_ROWS_LIMIT: u64 = 10_000_000;

/// Errors raised when a configuration fails validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is out of range.
    #[error("invalid engine configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Which optimizer passes run, and how many fixpoint rounds are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Fold literal-only sub-expressions.
    pub constant_folding: bool,
    /// Move filters toward the source.
    pub predicate_pushdown: bool,
    /// Drop unused columns early.
    pub projection_pushdown: bool,
    /// Remove operations that cannot change the result.
    pub dead_operation_elimination: bool,
    /// Reorder adjacent filters cheapest-first.
    pub stage_reordering: bool,
    /// Maximum passes over the pipeline before giving up on a fixpoint.
    #[validate(range(min = 1, max = 100, message = "max_iterations must be between 1 and 100"))]
    pub max_iterations: u32,
}

impl OptimizerConfig {
    /// A configuration with every pass disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            constant_folding: false,
            predicate_pushdown: false,
            projection_pushdown: false,
            dead_operation_elimination: false,
            stage_reordering: false,
            max_iterations: 1,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            constant_folding: true,
            predicate_pushdown: true,
            projection_pushdown: true,
            dead_operation_elimination: true,
            stage_reordering: true,
            max_iterations: 10,
        }
    }
}

/// Top-level engine configuration.
///
/// # Example
///
/// ```
/// use engine::config::EngineConfig;
///
/// let config = EngineConfig::default().with_default_max_rows(500);
/// assert!(config.validate_config().is_ok());
/// assert_eq!(config.default_max_rows, 500);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied when the caller does not supply one.
    #[validate(range(min = 1, max = 600_000, message = "timeout must be between 1ms and 10 minutes"))]
    pub default_timeout_ms: u64,
    /// Row cap applied when the caller does not supply one.
    #[validate(range(min = 1, max = 10_000_000, message = "max rows must be between 1 and 10000000"))]
    pub default_max_rows: u64,
    /// Maximum number of cached results (0 disables caching).
    pub cache_capacity: usize,
    /// Lifetime of a cached result in seconds.
    #[validate(range(min = 1, message = "cache TTL must be at least one second"))]
    pub cache_ttl_secs: u64,
    /// Optimizer settings.
    #[validate(nested)]
    pub optimizer: OptimizerConfig,
}

impl EngineConfig {
    /// Sets the default timeout.
    #[must_use]
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Sets the default row cap.
    #[must_use]
    pub fn with_default_max_rows(mut self, max_rows: u64) -> Self {
        self.default_max_rows = max_rows;
        self
    }

    /// Sets cache capacity and TTL.
    #[must_use]
    pub fn with_cache(mut self, capacity: usize, ttl_secs: u64) -> Self {
        self.cache_capacity = capacity;
        self.cache_ttl_secs = ttl_secs;
        self
    }

    /// Replaces the optimizer settings.
    #[must_use]
    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Cache TTL as a `Duration`.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Validates all fields.
    ///
    /// # Errors
    ///
    /// Returns an error if a timeout, row cap, TTL or iteration bound is out
    /// of range.
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()?;
        Ok(())
    }
}

impl Default for EngineConfig {
    /// 30s timeout, 10 000 rows, 1 000 cached results for 5 minutes.
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            default_max_rows: 10_000,
            cache_capacity: 1_000,
            cache_ttl_secs: 300,
            optimizer: OptimizerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate_config().is_ok());
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.optimizer.max_iterations, 10);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = EngineConfig::default().with_default_timeout_ms(0);
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_timeout_above_limit_rejected() {
        let config = EngineConfig::default().with_default_timeout_ms(MAX_TIMEOUT_MS + 1);
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_row_cap_bounds() {
        assert!(EngineConfig::default()
            .with_default_max_rows(0)
            .validate_config()
            .is_err());
        assert!(EngineConfig::default()
            .with_default_max_rows(MAX_ROWS_LIMIT)
            .validate_config()
            .is_ok());
    }

    #[test]
    fn test_nested_optimizer_validation() {
        let optimizer = OptimizerConfig {
            max_iterations: 0,
            ..OptimizerConfig::default()
        };
        let config = EngineConfig::default().with_optimizer(optimizer);
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_disabled_optimizer() {
        let config = OptimizerConfig::disabled();
        assert!(!config.constant_folding);
        assert!(!config.stage_reordering);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"default_max_rows": 42, "optimizer": {"stage_reordering": false}}"#)
                .unwrap();
        assert_eq!(config.default_max_rows, 42);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert!(!config.optimizer.stage_reordering);
        assert!(config.optimizer.predicate_pushdown);
    }
}
