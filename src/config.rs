// Runtime configuration, read from the environment (.env honoured in development)

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::StoreOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub store: StoreOptions,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = StoreOptions::default();

        let max_attempts: u32 = match lookup("EXCHANGE_STORE_MAX_ATTEMPTS") {
            Some(raw) => raw
                .parse()
                .context("EXCHANGE_STORE_MAX_ATTEMPTS must be a positive integer")?,
            None => defaults.max_attempts,
        };
        if max_attempts == 0 {
            bail!("EXCHANGE_STORE_MAX_ATTEMPTS must be at least 1");
        }

        let busy_timeout_ms: u64 = match lookup("EXCHANGE_STORE_BUSY_TIMEOUT_MS") {
            Some(raw) => raw
                .parse()
                .context("EXCHANGE_STORE_BUSY_TIMEOUT_MS must be a number of milliseconds")?,
            None => defaults.busy_timeout.as_millis() as u64,
        };

        let backoff_ms: u64 = match lookup("EXCHANGE_STORE_BACKOFF_MS") {
            Some(raw) => raw
                .parse()
                .context("EXCHANGE_STORE_BACKOFF_MS must be a number of milliseconds")?,
            None => defaults.backoff.as_millis() as u64,
        };

        Ok(Self {
            db_path: lookup("EXCHANGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("trust_exchange.db")),
            bind_addr: lookup("EXCHANGE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            store: StoreOptions {
                max_attempts,
                busy_timeout: Duration::from_millis(busy_timeout_ms),
                backoff: Duration::from_millis(backoff_ms),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.db_path, PathBuf::from("trust_exchange.db"));
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.store.max_attempts, 5);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("EXCHANGE_DB_PATH", "/tmp/x.db"),
            ("EXCHANGE_STORE_MAX_ATTEMPTS", "9"),
            ("EXCHANGE_STORE_BUSY_TIMEOUT_MS", "1000"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.store.max_attempts, 9);
        assert_eq!(config.store.busy_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = Config::from_lookup(lookup_from(&[("EXCHANGE_STORE_MAX_ATTEMPTS", "0")]));
        assert!(result.is_err());

        let result = Config::from_lookup(lookup_from(&[("EXCHANGE_STORE_MAX_ATTEMPTS", "many")]));
        assert!(result.is_err());
    }
}
