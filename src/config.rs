//! Runtime configuration.
//!
//! Every field has a default; `from_env` overrides them from `LEDGER_*`
//! environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::DEFAULT_ACCOUNT_NUMBER_PREFIX;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// sqlx SQLite URL, e.g. `sqlite:ledger.db`
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
    /// Upper bound on waiting for account locks, the SQLite writer lock and
    /// a pooled connection
    pub lock_timeout: Duration,
    /// How many times an operation that hit `LockTimeout` is retried
    pub lock_retries: u32,
    /// Base delay between lock retries, multiplied by the attempt number
    pub retry_backoff: Duration,
    /// Required prefix of every account number
    pub account_number_prefix: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:strongroom.db".to_string(),
            max_connections: 8,
            lock_timeout: Duration::from_secs(5),
            lock_retries: 2,
            retry_backoff: Duration::from_millis(25),
            account_number_prefix: DEFAULT_ACCOUNT_NUMBER_PREFIX.to_string(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env::var("LEDGER_DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env::var("LEDGER_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_connections),
            lock_timeout: env::var("LEDGER_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            lock_retries: env::var("LEDGER_LOCK_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lock_retries),
            retry_backoff: env::var("LEDGER_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            account_number_prefix: env::var("LEDGER_ACCOUNT_PREFIX")
                .unwrap_or(defaults.account_number_prefix),
        }
    }

    /// Point the configuration at a database file path.
    pub fn with_database_path(mut self, path: &str) -> Self {
        self.database_url = format!("sqlite:{}", path);
        self
    }
}
