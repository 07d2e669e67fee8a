//! Configuration for the ledger

use crate::currency::Currency;
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Durable store configuration
    pub storage: StorageConfig,

    /// Economy policy defaults
    pub economy: EconomyConfig,

    /// Configured currencies
    pub currencies: Vec<Currency>,

    /// Write-behind worker configuration
    pub write_behind: WriteBehindConfig,

    /// Leaderboard configuration
    pub leaderboard: LeaderboardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "player-ledger".to_string(),
            storage: StorageConfig::default(),
            economy: EconomyConfig::default(),
            currencies: vec![Currency::dollar()],
            write_behind: WriteBehindConfig::default(),
            leaderboard: LeaderboardConfig::default(),
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite URL, e.g. `sqlite://data/ledger.db` or `sqlite::memory:`
    pub database_url: String,

    /// Pool size
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/ledger.db".to_string(),
            max_connections: 4,
        }
    }
}

/// Economy policy defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    /// Default-currency balance for new accounts
    pub start_balance: Decimal,

    /// Whether balances may go below zero at all
    pub allow_negative_balance: bool,

    /// How far below zero a balance may go when negatives are allowed
    pub default_debt_limit: Decimal,

    /// Global cap on any balance, if set
    pub max_balance: Option<Decimal>,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            start_balance: Decimal::new(1000, 0),
            allow_negative_balance: false,
            default_debt_limit: Decimal::ZERO,
            max_balance: None,
        }
    }
}

/// Write-behind worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBehindConfig {
    /// Maximum batch size (operations)
    pub max_batch_size: usize,

    /// Batch timeout (milliseconds)
    pub batch_timeout_ms: u64,

    /// Enable batching
    pub enabled: bool,

    /// Retries for a failed batch before acknowledgements fail
    pub max_retries: u32,

    /// Backoff step between retries (milliseconds)
    pub retry_backoff_ms: u64,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,         // 100 operations per batch
            batch_timeout_ms: 10,        // 10ms timeout
            enabled: true,
            max_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl WriteBehindConfig {
    /// Batch timeout as a duration
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Retry backoff step as a duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Leaderboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardConfig {
    /// Serve leaderboards at all
    pub enabled: bool,

    /// Cache lifetime (seconds)
    pub ttl_secs: u64,

    /// Rows kept per currency
    pub size: u32,

    /// Rows per page
    pub page_size: u32,

    /// Background refresh period (seconds); none disables the refresher
    pub refresh_interval_secs: Option<u64>,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,               // 5 minutes
            size: 100,
            page_size: 10,
            refresh_interval_secs: None,
        }
    }
}

impl LeaderboardConfig {
    /// Cache lifetime as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LEDGER_*` overrides on top of the current values
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("LEDGER_DATABASE_URL") {
            self.storage.database_url = url;
        }

        if let Ok(value) = std::env::var("LEDGER_START_BALANCE") {
            self.economy.start_balance = parse_env("LEDGER_START_BALANCE", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_ALLOW_NEGATIVE") {
            self.economy.allow_negative_balance = parse_env("LEDGER_ALLOW_NEGATIVE", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_DEBT_LIMIT") {
            self.economy.default_debt_limit = parse_env("LEDGER_DEBT_LIMIT", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_LEADERBOARD_TTL_SECS") {
            self.leaderboard.ttl_secs = parse_env("LEDGER_LEADERBOARD_TTL_SECS", &value)?;
        }

        Ok(())
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.economy.default_debt_limit.is_sign_negative() {
            return Err(Error::Config("default_debt_limit must not be negative".to_string()));
        }
        if self.economy.start_balance.is_sign_negative() {
            return Err(Error::Config("start_balance must not be negative".to_string()));
        }
        if let Some(max) = self.economy.max_balance {
            if max < self.economy.start_balance {
                return Err(Error::Config(format!(
                    "max_balance {} is below start_balance {}",
                    max, self.economy.start_balance
                )));
            }
        }
        if self.write_behind.max_batch_size == 0 {
            return Err(Error::Config("write_behind.max_batch_size must be positive".to_string()));
        }
        if self.write_behind.enabled && self.write_behind.batch_timeout_ms == 0 {
            return Err(Error::Config("write_behind.batch_timeout_ms must be positive".to_string()));
        }
        if self.leaderboard.size == 0 || self.leaderboard.page_size == 0 {
            return Err(Error::Config("leaderboard size and page_size must be positive".to_string()));
        }
        if self.storage.max_connections == 0 {
            return Err(Error::Config("storage.max_connections must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "player-ledger");
        assert_eq!(config.economy.start_balance, Decimal::new(1000, 0));
        assert!(!config.economy.allow_negative_balance);
        assert_eq!(config.leaderboard.ttl_secs, 300);
        assert_eq!(config.leaderboard.size, 100);
        assert_eq!(config.leaderboard.page_size, 10);
        assert!(config.write_behind.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r##"
            [economy]
            allow_negative_balance = true
            default_debt_limit = "250"

            [[currencies]]
            id = "Gems"
            display_name = "Gems"
            symbol = "G"
            format_spec = "#,##0"
            "##,
        )
        .unwrap();

        assert!(config.economy.allow_negative_balance);
        assert_eq!(config.economy.default_debt_limit, Decimal::new(250, 0));
        assert_eq!(config.economy.start_balance, Decimal::new(1000, 0));
        assert_eq!(config.currencies.len(), 1);
        assert_eq!(config.currencies[0].id.as_str(), "gems");
        assert_eq!(config.write_behind.max_batch_size, 100);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = Config::default();
        config.economy.default_debt_limit = Decimal::new(-1, 0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.leaderboard.page_size = 0;
        assert!(config.validate().is_err());

        assert!(Config::from_toml("economy = 3").is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let config = Config::default();
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.storage.database_url, config.storage.database_url);
        assert_eq!(loaded.currencies, config.currencies);
    }
}
