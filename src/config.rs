//! Daemon configuration: TOML file plus environment overrides.
//!
//! The file is looked up at `forged.toml` (or wherever
//! `FORGED_CONFIG_FILE` points); a missing file just means defaults.
//! Secrets and deployment-specific values can be supplied through the
//! environment instead, which wins over the file.

use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::api::server::DEFAULT_POOL_INVALIDATION_TIMEOUT;
use crate::api::ServerOptions;
use crate::types::Address;

pub const CONFIG_FILE_ENV: &str = "FORGED_CONFIG_FILE";
pub const API_PASSWORD_ENV: &str = "FORGED_API_PASSWORD";
pub const PAYOUT_ADDRESS_ENV: &str = "FORGED_PAYOUT_ADDRESS";
pub const LOG_LEVEL_ENV: &str = "FORGED_LOG_LEVEL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// "mainnet" or "devnet".
    pub network: String,

    /// Address the HTTP API listens on.
    pub http_address: String,

    /// Basic-auth password; empty disables auth.
    pub password: String,

    /// Hex payout address for block templates; empty means
    /// `getblocktemplate` answers 503 until one is configured.
    pub payout_address: String,

    /// Maximum cached-template age in seconds; 0 disables the limit.
    pub max_template_age_secs: u64,

    /// Debounce window for pool-driven template invalidations.
    pub pool_invalidation_timeout_ms: u64,

    /// Default log filter (overridden by `RUST_LOG`).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            network: "mainnet".into(),
            http_address: "localhost:9980".into(),
            password: String::new(),
            payout_address: String::new(),
            max_template_age_secs: 0,
            pool_invalidation_timeout_ms: DEFAULT_POOL_INVALIDATION_TIMEOUT.as_millis() as u64,
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Parses a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Loads the config file if one exists, then applies environment
    /// overrides.
    pub fn load() -> Result<Config> {
        let path = env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| "forged.toml".into());
        let mut cfg = if Path::new(&path).exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var(API_PASSWORD_ENV) {
            self.password = v;
        }
        if let Ok(v) = env::var(PAYOUT_ADDRESS_ENV) {
            self.payout_address = v;
        }
        if let Ok(v) = env::var(LOG_LEVEL_ENV) {
            self.log_level = v;
        }
    }

    /// The configured payout address; empty means the void sentinel.
    pub fn payout_addr(&self) -> Result<Address> {
        if self.payout_address.is_empty() {
            return Ok(Address::VOID);
        }
        self.payout_address
            .parse()
            .with_context(|| format!("invalid payout address {:?}", self.payout_address))
    }

    pub fn max_template_age(&self) -> Option<Duration> {
        match self.max_template_age_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn pool_invalidation_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_invalidation_timeout_ms)
    }

    /// The mining-server tunables this config describes.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            password: (!self.password.is_empty()).then(|| self.password.clone()),
            max_template_age: self.max_template_age(),
            pool_invalidation_timeout: self.pool_invalidation_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_open_and_unlimited() {
        let cfg = Config::default();
        assert!(cfg.payout_addr().unwrap() == Address::VOID);
        assert!(cfg.max_template_age().is_none());
        assert_eq!(
            cfg.pool_invalidation_timeout(),
            DEFAULT_POOL_INVALIDATION_TIMEOUT
        );
        let opts = cfg.server_options();
        assert!(opts.password.is_none());
    }

    #[test]
    fn parses_toml_fields() {
        let cfg: Config = toml::from_str(
            r#"
                network = "devnet"
                http_address = "127.0.0.1:7777"
                password = "hunter2"
                payout_address = "1111111111111111111111111111111111111111111111111111111111111111"
                max_template_age_secs = 30
                pool_invalidation_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.network, "devnet");
        assert_eq!(cfg.payout_addr().unwrap(), crate::testutil::test_addr(0x11));
        assert_eq!(cfg.max_template_age(), Some(Duration::from_secs(30)));
        let opts = cfg.server_options();
        assert_eq!(opts.password.as_deref(), Some("hunter2"));
        assert_eq!(opts.pool_invalidation_timeout, Duration::from_millis(500));
    }

    #[test]
    fn rejects_bad_payout_address() {
        let cfg = Config {
            payout_address: "not hex".into(),
            ..Config::default()
        };
        assert!(cfg.payout_addr().is_err());
    }
}
