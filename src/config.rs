//! Engine configuration, read from TOML.

use std::{io, path::Path, time::Duration};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::checksum::Algorithm;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid configuration")]
    Parse(#[from] toml::de::Error),

    #[error("delivery_threads must be at least 1")]
    NoDeliveryThreads,

    #[error(
        "pending_timeout ({timeout:?}) must not be shorter than \
         modification_locking_time ({locking:?})"
    )]
    PendingTimeoutTooShort { timeout: Duration, locking: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Quiet period before a file is checksummed.
    #[serde(deserialize_with = "human_duration")]
    pub write_deadline: Duration,

    /// How long a dispatch cycle collects events before it is delivered.
    #[serde(deserialize_with = "human_duration")]
    pub dispatch_delay: Duration,

    /// Window after a CREATE in which MODIFY events of the same path are
    /// dropped.
    #[serde(deserialize_with = "human_duration")]
    pub modification_locking_time: Duration,

    /// Upper bound for a MODIFY held back by a pending CREATE.
    #[serde(deserialize_with = "human_duration")]
    pub pending_timeout: Duration,

    pub delivery_threads: usize,

    pub algorithm: Algorithm,

    /// Debounce applied by the native watcher.
    #[serde(deserialize_with = "human_duration")]
    pub watcher_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_deadline: Duration::from_secs(2),
            dispatch_delay: Duration::from_secs(3),
            modification_locking_time: Duration::from_millis(500),
            pending_timeout: Duration::from_secs(10),
            delivery_threads: 5,
            algorithm: Algorithm::Sha256,
            watcher_debounce: Duration::from_millis(50),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs_err::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery_threads == 0 {
            return Err(ConfigError::NoDeliveryThreads);
        }

        if self.pending_timeout < self.modification_locking_time {
            return Err(ConfigError::PendingTimeoutTooShort {
                timeout: self.pending_timeout,
                locking: self.modification_locking_time,
            });
        }

        Ok(())
    }
}

fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}
