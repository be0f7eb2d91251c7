//! Daemon configuration, loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use sendledger_core::DispatchPolicy;

/// Root configuration mirroring the JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the `SQLite` database file.
    pub database_path: String,
    /// Address campaigns are sent from.
    pub sender_address: String,
    /// Seconds between polls for due campaigns.
    pub poll_interval_secs: u64,
    /// Address the inbound event listener binds to.
    pub listen_addr: String,
    /// Mail API settings.
    pub transport: TransportConfig,
    /// Batch dispatch tuning.
    pub dispatch: DispatchConfig,
}

/// Mail API settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the mail API.
    pub base_url: String,
    /// API key for outbound submissions.
    pub api_key: String,
    /// Shared secret for inbound webhook signatures.
    pub webhook_secret: String,
}

/// Batch dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Records submitted per batch.
    pub batch_size: usize,
    /// Milliseconds between batches.
    pub batch_delay_ms: u64,
    /// Total submission attempts per record.
    pub max_attempts: u32,
    /// Milliseconds before the first retry.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sendledger");
        Self {
            database_path: data_dir.join("sendledger.db").display().to_string(),
            sender_address: String::new(),
            poll_interval_secs: 30,
            listen_addr: "127.0.0.1:8322".to_string(),
            transport: TransportConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let policy = DispatchPolicy::default();
        Self {
            batch_size: policy.batch_size,
            batch_delay_ms: policy.batch_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl Config {
    /// The dispatch policy this configuration describes.
    #[must_use]
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            batch_size: self.dispatch.batch_size,
            batch_delay: Duration::from_millis(self.dispatch.batch_delay_ms),
            max_attempts: self.dispatch.max_attempts,
            initial_backoff: Duration::from_millis(self.dispatch.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.dispatch.max_backoff_ms),
        }
    }

    /// Checks the configuration is usable before any connection is opened.
    ///
    /// # Errors
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.sender_address.contains('@') {
            bail!("sender_address must be an email address");
        }
        if self.transport.base_url.is_empty() {
            bail!("transport.base_url is required");
        }
        if self.transport.api_key.is_empty() {
            bail!("transport.api_key is required");
        }
        if self.transport.webhook_secret.is_empty() {
            bail!("transport.webhook_secret is required");
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("listen_addr must be a socket address like 127.0.0.1:8322");
        }
        if self.dispatch.batch_size == 0 {
            bail!("dispatch.batch_size must be at least 1");
        }
        if self.dispatch.max_attempts == 0 {
            bail!("dispatch.max_attempts must be at least 1");
        }
        Ok(())
    }
}

/// The default config file location.
#[must_use]
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sendledger")
        .join("config.json")
}

/// Loads and validates the configuration at `path`.
///
/// # Errors
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("parsing config from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
