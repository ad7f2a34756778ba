use std::{path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "RETRIEVAL";
pub const DEFAULT_KEEP_ALIVE_TOKEN: &str = "MessageRetrieval";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub read_timeout_ms: u64,
    pub censored_read_timeout_ms: u64,
    pub max_background_ms: u64,
    pub censored_max_background_ms: u64,
    pub batch_size: usize,
    pub backoff_cap_ms: u64,
    pub keep_alive_token: String,
    pub network_resubscribe_attempts: u32,
    pub network_resubscribe_delay_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 60_000,
            censored_read_timeout_ms: 30_000,
            max_background_ms: 120_000,
            censored_max_background_ms: 10_000,
            batch_size: 30,
            backoff_cap_ms: 30_000,
            keep_alive_token: DEFAULT_KEEP_ALIVE_TOKEN.into(),
            network_resubscribe_attempts: 5,
            network_resubscribe_delay_ms: 1_000,
        }
    }
}

impl RetrievalConfig {
    /// How long a single read may block before the server is considered idle.
    pub fn read_timeout(&self, censored: bool) -> Duration {
        if censored {
            Duration::from_millis(self.censored_read_timeout_ms)
        } else {
            Duration::from_millis(self.read_timeout_ms)
        }
    }

    /// How long the connection may outlive a move to the background.
    pub fn max_background_time(&self, censored: bool) -> Duration {
        if censored {
            Duration::from_millis(self.censored_max_background_ms)
        } else {
            Duration::from_millis(self.max_background_ms)
        }
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn network_resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.network_resubscribe_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        if self.read_timeout_ms == 0 || self.censored_read_timeout_ms == 0 {
            bail!("read timeouts must be greater than zero");
        }
        if self.backoff_cap_ms == 0 {
            bail!("backoff_cap_ms must be greater than zero");
        }
        if self.keep_alive_token.trim().is_empty() {
            bail!("keep_alive_token must not be empty");
        }
        Ok(())
    }
}

/// Layers an optional TOML file under `RETRIEVAL__*` environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<RetrievalConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let settings = builder
        .build()
        .context("failed to assemble retrieval configuration")?;
    let config: RetrievalConfig = settings
        .try_deserialize()
        .context("invalid retrieval configuration")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
