//! Typed configuration from environment variables, plus optional scheduler
//! tuning from a TOML file.
//!
//! Loads once at startup and fails fast on malformed values. `VERIFY_URL` is
//! only required by commands that verify, so it is checked in
//! [`Config::verifier`].
//! The proxy URL may carry credentials, so it is held as a `SecretString`.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::backoff::AdaptiveDelay;
use crate::engine::SchedulerConfig;
use crate::error::{Error, Result};
use crate::verifier::HttpVerifierConfig;

#[derive(Debug)]
pub struct Config {
    /// Directory holding the pending, result and token files.
    pub data_dir: PathBuf,
    /// Endpoint for the HTTP verifier. Unset on hosts that only ingest,
    /// feed tokens or monitor.
    pub verify_url: Option<String>,
    pub proxy: Option<SecretString>,
    pub token_header: String,
    pub token_prefix: String,
    pub item_field: String,
    pub exists_field: String,
    pub request_timeout: Duration,
    pub tuning: Tuning,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let tuning = match std::env::var("VERIFYQ_TUNING") {
            Ok(path) => Tuning::load(Path::new(&path))?,
            Err(_) => Tuning::default(),
        };

        Ok(Self {
            data_dir: PathBuf::from(var_or("VERIFYQ_DATA_DIR", "results")),
            verify_url: std::env::var("VERIFY_URL").ok(),
            proxy: std::env::var("VERIFY_PROXY").ok().map(SecretString::from),
            token_header: var_or("VERIFY_TOKEN_HEADER", "authorization"),
            token_prefix: var_or("VERIFY_TOKEN_PREFIX", "Bearer "),
            item_field: var_or("VERIFY_ITEM_FIELD", "id"),
            exists_field: var_or("VERIFY_EXISTS_FIELD", "exists"),
            request_timeout: Duration::from_secs(parsed_var("VERIFY_TIMEOUT_SECS", 20)?),
            tuning,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }

    /// Request shape for the HTTP verifier. Fails if `VERIFY_URL` is unset.
    pub fn verifier(&self) -> Result<HttpVerifierConfig> {
        let url = self.verify_url.clone().ok_or_else(|| {
            Error::Config("required environment variable VERIFY_URL is not set".to_string())
        })?;
        Ok(HttpVerifierConfig {
            url,
            token_header: self.token_header.clone(),
            token_prefix: self.token_prefix.clone(),
            item_field: self.item_field.clone(),
            exists_field: self.exists_field.clone(),
            timeout: self.request_timeout,
            proxy: self.proxy.clone(),
        })
    }
}

/// Scheduler, retry and token-budget tuning. Every field has a default, so
/// a tuning file only lists what it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub batch_size: usize,
    pub max_retries: u32,
    pub token_limit_min: u32,
    pub token_limit_max: u32,
    pub token_poll_interval_secs: u64,
    pub token_wait_ceiling_secs: u64,
    pub healthy_delay_secs: u64,
    pub degraded_delay_secs: u64,
    pub stalled_delay_secs: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_retries: 3,
            token_limit_min: 5,
            token_limit_max: 7,
            token_poll_interval_secs: 5,
            token_wait_ceiling_secs: 60,
            healthy_delay_secs: 2,
            degraded_delay_secs: 5,
            stalled_delay_secs: 10,
            failure_threshold: 10,
            cooldown_secs: 300,
        }
    }
}

impl Tuning {
    /// Read and validate a TOML tuning file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read tuning file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad tuning file {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let tuning: Tuning = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        tuning.validate()?;
        Ok(tuning)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.token_limit_min == 0 || self.token_limit_min > self.token_limit_max {
            return Err(Error::Config(format!(
                "token limits must satisfy 1 <= min <= max, got {}..={}",
                self.token_limit_min, self.token_limit_max
            )));
        }
        Ok(())
    }

    pub fn token_limits(&self) -> std::ops::RangeInclusive<u32> {
        self.token_limit_min..=self.token_limit_max
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: self.batch_size,
            token_poll_interval: Duration::from_secs(self.token_poll_interval_secs),
            token_wait_ceiling: Duration::from_secs(self.token_wait_ceiling_secs),
            delay: AdaptiveDelay {
                healthy: Duration::from_secs(self.healthy_delay_secs),
                degraded: Duration::from_secs(self.degraded_delay_secs),
                stalled: Duration::from_secs(self.stalled_delay_secs),
            },
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} has invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults_fill_missing_fields() {
        let tuning = Tuning::parse("batch_size = 8\nmax_retries = 1\n").unwrap();
        assert_eq!(tuning.batch_size, 8);
        assert_eq!(tuning.max_retries, 1);
        assert_eq!(tuning.token_limits(), 5..=7);
        assert_eq!(tuning.scheduler().cooldown, Duration::from_secs(300));
    }

    #[test]
    fn tuning_rejects_bad_values() {
        assert!(Tuning::parse("batch_size = 0").is_err());
        assert!(Tuning::parse("token_limit_min = 9").is_err());
        assert!(Tuning::parse("token_limit_min = 0").is_err());
        assert!(Tuning::parse("bogus = 1").is_err());
    }
}
