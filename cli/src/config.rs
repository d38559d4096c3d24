//! CLI configuration.
//!
//! Values come from the environment (after loading a `.env` file when one is
//! present) and can be overridden by command-line flags.

use anyhow::{Context, Result};
use engine::config::EngineConfig;
use std::str::FromStr;

/// Runtime configuration for the `vigil` binary.
///
/// Configuration values can be set via environment variables:
/// - `VIGIL_QUERY_TIMEOUT_MS`: per-query timeout (default: 30000)
/// - `VIGIL_MAX_ROWS`: row cap per query (default: 10000)
/// - `VIGIL_CACHE_CAPACITY`: result cache entries, 0 disables (default: 1000)
/// - `VIGIL_CACHE_TTL_SECS`: result cache lifetime (default: 300)
/// - `VIGIL_DB_URL`: ClickHouse HTTP endpoint (default: `http://localhost:8123`)
/// - `VIGIL_DB_NAME`: ClickHouse database (default: "default")
/// - `VIGIL_DB_USER` / `VIGIL_DB_PASSWORD`: optional credentials
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine settings.
    pub engine: EngineConfig,
    /// ClickHouse HTTP endpoint.
    pub db_url: String,
    /// ClickHouse database.
    pub db_name: String,
    /// ClickHouse user.
    pub db_user: Option<String>,
    /// ClickHouse password.
    pub db_password: Option<String>,
}

impl Config {
    /// Creates a configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable is set but does not parse, or
    /// if the resulting engine configuration is out of range.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = EngineConfig::default();
        let engine = EngineConfig::default()
            .with_default_timeout_ms(
                parsed(&lookup, "VIGIL_QUERY_TIMEOUT_MS")?.unwrap_or(defaults.default_timeout_ms),
            )
            .with_default_max_rows(
                parsed(&lookup, "VIGIL_MAX_ROWS")?.unwrap_or(defaults.default_max_rows),
            )
            .with_cache(
                parsed(&lookup, "VIGIL_CACHE_CAPACITY")?.unwrap_or(defaults.cache_capacity),
                parsed(&lookup, "VIGIL_CACHE_TTL_SECS")?.unwrap_or(defaults.cache_ttl_secs),
            );
        engine.validate_config()?;

        Ok(Self {
            engine,
            db_url: lookup("VIGIL_DB_URL").unwrap_or_else(|| "http://localhost:8123".to_string()),
            db_name: lookup("VIGIL_DB_NAME").unwrap_or_else(|| "default".to_string()),
            db_user: lookup("VIGIL_DB_USER"),
            db_password: lookup("VIGIL_DB_PASSWORD"),
        })
    }

    /// Builds a ClickHouse client from the connection settings.
    #[must_use]
    pub fn clickhouse_client(&self) -> clickhouse::Client {
        let mut client = clickhouse::Client::default()
            .with_url(&self.db_url)
            .with_database(&self.db_name);
        if let Some(user) = &self.db_user {
            client = client.with_user(user);
        }
        if let Some(password) = &self.db_password {
            client = client.with_password(password);
        }
        client
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} is not a valid number"))
}
