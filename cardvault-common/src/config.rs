//! Configuration loading for the CardVault engine
//!
//! Resolution priority: CLI argument → environment variable → TOML
//! config file → compiled default. The binary passes CLI values in;
//! this module handles the TOML/default tiers for every tunable, plus
//! the deployment-location env overrides `CARDVAULT_PORT` and
//! `CARDVAULT_DB`. All other tunables are set through the TOML file.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_port() -> u16 {
    5810
}

fn default_database_path() -> PathBuf {
    PathBuf::from("cardvault.db")
}

fn default_idempotency_ttl_secs() -> u64 {
    600
}

fn default_pricing_cache_ttl_secs() -> u64 {
    86_400
}

fn default_extraction_timeout_secs() -> u64 {
    15
}

fn default_source_timeout_secs() -> u64 {
    10
}

fn default_reasoning_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_counterfeit_threshold() -> f64 {
    0.5
}

fn default_event_capacity() -> usize {
    256
}

fn default_vision_base_url() -> String {
    "http://127.0.0.1:7401".to_string()
}

fn default_reasoning_base_url() -> String {
    "http://127.0.0.1:7402".to_string()
}

fn default_tcg_portal_base_url() -> String {
    "https://api.tcgportal.example".to_string()
}

fn default_auction_archive_base_url() -> String {
    "https://api.auctionarchive.example".to_string()
}

/// Engine configuration
///
/// All durations are plain integers in the TOML file (seconds or
/// milliseconds as named) to keep the file hand-editable.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Idempotency key validity window (seconds)
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Pricing cache entry TTL (seconds)
    #[serde(default = "default_pricing_cache_ttl_secs")]
    pub pricing_cache_ttl_secs: u64,

    /// Vision extraction call timeout (seconds)
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,

    /// Per-source marketplace call timeout (seconds)
    #[serde(default = "default_source_timeout_secs")]
    pub source_timeout_secs: u64,

    /// Reasoning adapter call timeout (seconds)
    #[serde(default = "default_reasoning_timeout_secs")]
    pub reasoning_timeout_secs: u64,

    /// Retry budget per workflow step
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff delay (milliseconds)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff delay cap (milliseconds)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Overall authenticity score below which the reasoning adapter is
    /// asked for a counterfeit judgment
    #[serde(default = "default_counterfeit_threshold")]
    pub counterfeit_threshold: f64,

    /// Event bus channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Vision extraction service base URL
    #[serde(default = "default_vision_base_url")]
    pub vision_base_url: String,

    /// Reasoning service base URL
    #[serde(default = "default_reasoning_base_url")]
    pub reasoning_base_url: String,

    /// TCG Portal marketplace API base URL
    #[serde(default = "default_tcg_portal_base_url")]
    pub tcg_portal_base_url: String,

    /// Auction Archive marketplace API base URL
    #[serde(default = "default_auction_archive_base_url")]
    pub auction_archive_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Deserializing an empty table applies every serde default
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file, then apply the
    /// `CARDVAULT_PORT` / `CARDVAULT_DB` environment overrides.
    ///
    /// A missing file is not an error when `path` is None (defaults
    /// apply); an explicitly named file that cannot be read or parsed
    /// is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    Error::Config(format!("Failed to read config file {}: {}", p.display(), e))
                })?;
                toml::from_str(&raw).map_err(|e| {
                    Error::Config(format!("Failed to parse config file {}: {}", p.display(), e))
                })?
            }
            None => Self::default(),
        };

        if let Ok(port) = std::env::var("CARDVAULT_PORT") {
            config.port = port
                .parse()
                .map_err(|e| Error::Config(format!("Invalid CARDVAULT_PORT: {}", e)))?;
        }
        if let Ok(db) = std::env::var("CARDVAULT_DB") {
            config.database_path = PathBuf::from(db);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.counterfeit_threshold) {
            return Err(Error::Config(
                "counterfeit_threshold must be within [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.port, 5810);
        assert_eq!(config.idempotency_ttl_secs, 600);
        assert_eq!(config.pricing_cache_ttl_secs, 86_400);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: EngineConfig =
            toml::from_str("port = 9000\nmax_attempts = 5").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_attempts, 5);
        // Untouched fields keep their defaults
        assert_eq!(config.extraction_timeout_secs, 15);
    }

    #[test]
    fn test_env_overrides_cover_port_and_database_path() {
        std::env::set_var("CARDVAULT_PORT", "7123");
        std::env::set_var("CARDVAULT_DB", "/tmp/cardvault-env-test.db");
        let config = EngineConfig::load(None).unwrap();
        std::env::remove_var("CARDVAULT_PORT");
        std::env::remove_var("CARDVAULT_DB");

        assert_eq!(config.port, 7123);
        assert_eq!(config.database_path, PathBuf::from("/tmp/cardvault-env-test.db"));
        // Everything else stays on its TOML/default tier
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = EngineConfig::default();
        config.counterfeit_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
