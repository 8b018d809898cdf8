//! Daemon configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `conductor.toml` in the working directory, then `CONDUCTOR__*`
//! environment variables (`CONDUCTOR__LOCK__EXPIRY_SECS=10`).

use conductor_core::application::constants::DEFAULT_BACKGROUND_POLL_INTERVAL;
use conductor_core::application::maintenance::DEFAULT_PURGE_CRON;
use conductor_core::error::{AppError, Result};
use conductor_core::port::{LockConfig, LockProvider, PubSubConfig, PubSubProvider};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

const CONFIG_FILE: &str = "conductor";
const ENV_PREFIX: &str = "CONDUCTOR";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub lock: LockSettings,
    pub pubsub: PubSubSettings,
    pub jobs: JobSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub provider: LockProvider,
    pub app: String,
    pub namespace: String,
    pub expiry_secs: u64,
    pub tries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubSettings {
    pub provider: PubSubProvider,
    pub app: String,
    pub namespace: String,
    pub channel_size: usize,
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub retention_days: u64,
    pub purge_cron: String,
    pub background_poll_secs: u64,
    /// Run the scheduler loop on the lease holder only
    pub leader_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            lock: LockSettings::default(),
            pubsub: PubSubSettings::default(),
            jobs: JobSettings::default(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        let defaults = LockConfig::default();
        Self {
            provider: defaults.provider,
            app: defaults.app,
            namespace: defaults.namespace,
            expiry_secs: defaults.expiry.as_secs(),
            tries: defaults.tries,
            retry_delay_ms: defaults.retry_delay.as_millis() as u64,
        }
    }
}

impl Default for PubSubSettings {
    fn default() -> Self {
        let defaults = PubSubConfig::default();
        Self {
            provider: defaults.provider,
            app: defaults.app,
            namespace: defaults.namespace,
            channel_size: defaults.channel_size,
            send_timeout_secs: defaults.send_timeout.as_secs(),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            purge_cron: DEFAULT_PURGE_CRON.to_string(),
            background_poll_secs: DEFAULT_BACKGROUND_POLL_INTERVAL.as_secs(),
            leader_only: false,
        }
    }
}

impl Settings {
    /// Load from `conductor.toml` (if present) and the environment.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(AppError::Config("database_url must not be empty".to_string()));
        }
        if self.lock.provider == LockProvider::Redis {
            return Err(AppError::Config(
                "lock provider 'redis' is not supported by this build".to_string(),
            ));
        }
        if self.pubsub.provider == PubSubProvider::Redis {
            return Err(AppError::Config(
                "pubsub provider 'redis' is not supported by this build".to_string(),
            ));
        }
        if self.lock.expiry_secs == 0 {
            return Err(AppError::Config("lock.expiry_secs must be positive".to_string()));
        }
        if self.lock.tries == 0 {
            return Err(AppError::Config("lock.tries must be positive".to_string()));
        }
        if self.pubsub.channel_size == 0 {
            return Err(AppError::Config("pubsub.channel_size must be positive".to_string()));
        }
        if self.pubsub.send_timeout_secs == 0 {
            return Err(AppError::Config(
                "pubsub.send_timeout_secs must be positive".to_string(),
            ));
        }
        if self.jobs.retention_days == 0 {
            return Err(AppError::Config("jobs.retention_days must be positive".to_string()));
        }
        if self.jobs.background_poll_secs == 0 {
            return Err(AppError::Config(
                "jobs.background_poll_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            app: self.lock.app.clone(),
            namespace: self.lock.namespace.clone(),
            provider: self.lock.provider,
            expiry: Duration::from_secs(self.lock.expiry_secs),
            tries: self.lock.tries,
            retry_delay: Duration::from_millis(self.lock.retry_delay_ms),
        }
    }

    pub fn pubsub_config(&self) -> PubSubConfig {
        PubSubConfig {
            app: self.pubsub.app.clone(),
            namespace: self.pubsub.namespace.clone(),
            provider: self.pubsub.provider,
            send_timeout: Duration::from_secs(self.pubsub.send_timeout_secs),
            channel_size: self.pubsub.channel_size,
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.jobs.retention_days * 24 * 60 * 60)
    }

    pub fn background_poll(&self) -> Duration {
        Duration::from_secs(self.jobs.background_poll_secs)
    }
}
