//! Backplane configuration.

use crate::error::{BackplaneError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Backplane configuration.
///
/// Durations are (de)serialized as milliseconds, e.g.
/// `{"max_rewind": 5, "observer_expiration_ms": 60000}`. Missing fields take
/// their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackplaneConfig {
    /// Messages each topic log retains for replay.
    /// Default: 10
    pub max_rewind: usize,

    /// Observers not renewed within this window are dropped on the next notify.
    /// Default: 5 minutes
    #[serde(rename = "observer_expiration_ms", with = "duration_ms")]
    pub observer_expiration: Duration,

    /// How often dirty membership sets are written to the store.
    /// Default: 30 seconds
    #[serde(rename = "persist_interval_ms", with = "duration_ms")]
    pub persist_interval: Duration,

    /// Topic actors without calls for this long are deactivated.
    /// Default: 15 minutes
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,

    /// How often the supervisor looks for idle actors.
    /// Default: 60 seconds
    #[serde(rename = "idle_check_interval_ms", with = "duration_ms")]
    pub idle_check_interval: Duration,

    /// Bounded mailbox size of each topic actor.
    /// Default: 1024
    pub mailbox_capacity: usize,

    /// Buffered deliveries per channel observer before it counts as lagging.
    /// Default: 1024
    pub observer_buffer: usize,

    /// How often a lifetime manager renews its subscriptions.
    /// Default: 60 seconds
    #[serde(rename = "renew_interval_ms", with = "duration_ms")]
    pub renew_interval: Duration,

    /// Delay before the first resubscribe retry; doubles per attempt.
    /// Default: 100 milliseconds
    #[serde(rename = "resubscribe_backoff_ms", with = "duration_ms")]
    pub resubscribe_backoff: Duration,

    /// Upper bound for the resubscribe delay. A live stream keeps retrying
    /// at this pace until it is re-established or stopped.
    /// Default: 5 seconds
    #[serde(rename = "resubscribe_max_backoff_ms", with = "duration_ms")]
    pub resubscribe_max_backoff: Duration,

    /// Hub names this backplane serves. Empty accepts any hub.
    pub hubs: Vec<String>,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            max_rewind: 10,
            observer_expiration: Duration::from_secs(5 * 60),
            persist_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(15 * 60),
            idle_check_interval: Duration::from_secs(60),
            mailbox_capacity: 1024,
            observer_buffer: 1024,
            renew_interval: Duration::from_secs(60),
            resubscribe_backoff: Duration::from_millis(100),
            resubscribe_max_backoff: Duration::from_secs(5),
            hubs: Vec::new(),
        }
    }
}

impl BackplaneConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BackplaneError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_rewind == 0 {
            return Err(BackplaneError::InvalidConfig(
                "max_rewind must be > 0".into(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(BackplaneError::InvalidConfig(
                "mailbox_capacity must be > 0".into(),
            ));
        }
        if self.observer_buffer == 0 {
            return Err(BackplaneError::InvalidConfig(
                "observer_buffer must be > 0".into(),
            ));
        }
        for (name, value) in [
            ("observer_expiration", self.observer_expiration),
            ("persist_interval", self.persist_interval),
            ("idle_timeout", self.idle_timeout),
            ("idle_check_interval", self.idle_check_interval),
            ("renew_interval", self.renew_interval),
            ("resubscribe_backoff", self.resubscribe_backoff),
        ] {
            if value.is_zero() {
                return Err(BackplaneError::InvalidConfig(format!(
                    "{name} must be non-zero"
                )));
            }
        }
        if self.renew_interval >= self.observer_expiration {
            return Err(BackplaneError::InvalidConfig(
                "renew_interval must be shorter than observer_expiration".into(),
            ));
        }
        if self.resubscribe_max_backoff < self.resubscribe_backoff {
            return Err(BackplaneError::InvalidConfig(
                "resubscribe_max_backoff must not be shorter than resubscribe_backoff".into(),
            ));
        }
        if let Some(hub) = self.hubs.iter().find(|h| h.is_empty()) {
            return Err(BackplaneError::InvalidConfig(format!(
                "hub names must be non-empty, got {hub:?}"
            )));
        }
        Ok(())
    }

    /// Whether `hub` is served by this backplane.
    pub fn serves_hub(&self, hub: &str) -> bool {
        self.hubs.is_empty() || self.hubs.iter().any(|h| h == hub)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
