//! Application configuration loaded from environment variables.

use std::time::Duration;

use doc_store::TransactionOptions;
use orders::RetryPolicy;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; the in-memory store is used when unset
/// - `SEED_SAMPLE_DATA`: replace the store contents with sample data on startup (default: `false`)
/// - `RETRY_MAX_ATTEMPTS`: attempts per placement, including the first (default: `5`)
/// - `RETRY_INITIAL_BACKOFF_MS`: wait before the first retry (default: `10`)
/// - `RETRY_MAX_BACKOFF_MS`: cap on any single wait (default: `500`)
/// - `TXN_MAX_LIFETIME_SECS`: bound on a transaction's lifetime (default: `60`)
///
/// Unparseable values fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub seed_sample_data: bool,
    pub retry: RetryPolicy,
    pub txn_max_lifetime: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let retry = RetryPolicy::new(
            lookup("RETRY_MAX_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.retry.max_attempts),
            parsed("RETRY_INITIAL_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_backoff),
            parsed("RETRY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_backoff),
        );

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            seed_sample_data: lookup("SEED_SAMPLE_DATA")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.seed_sample_data),
            retry,
            txn_max_lifetime: parsed("TXN_MAX_LIFETIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.txn_max_lifetime),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Transaction options for every placement attempt.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions::snapshot_majority().max_lifetime(self.txn_max_lifetime)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            seed_sample_data: false,
            retry: RetryPolicy::default(),
            txn_max_lifetime: doc_store::store::DEFAULT_MAX_LIFETIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert!(!config.seed_sample_data);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.txn_max_lifetime, Duration::from_secs(60));
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.addr(), Config::default().addr());
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = from_pairs(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/orders"),
            ("SEED_SAMPLE_DATA", "true"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("RETRY_INITIAL_BACKOFF_MS", "25"),
            ("RETRY_MAX_BACKOFF_MS", "200"),
            ("TXN_MAX_LIFETIME_SECS", "5"),
        ]);

        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/orders")
        );
        assert!(config.seed_sample_data);
        assert_eq!(
            config.retry,
            RetryPolicy::new(3, Duration::from_millis(25), Duration::from_millis(200))
        );
        assert_eq!(
            config.transaction_options().max_lifetime,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "http"),
            ("RETRY_MAX_ATTEMPTS", "-1"),
            ("SEED_SAMPLE_DATA", "maybe"),
            ("DATABASE_URL", "  "),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.seed_sample_data);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let config = from_pairs(&[("RETRY_MAX_ATTEMPTS", "0")]);
        assert_eq!(config.retry.max_attempts, 1);
    }
}
