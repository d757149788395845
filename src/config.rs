use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::time::TimeSyncMethod;

/// Errors produced while loading or validating a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config: {0}")]
    Read(String),
    #[error("failed parsing config: {0}")]
    Parse(String),
    #[error("preferred locale must be two ASCII letters, got {0:?}")]
    InvalidLocale(String),
    #[error("device id must not be empty")]
    EmptyDeviceId,
    #[error("no access points configured")]
    NoAccessPoints,
}

/// How the receive loop recovers from a transport fault.
///
/// `max_attempts` of `0` retries forever; the default of `1` fails as soon
/// as a single reconnection attempt does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl ReconnectPolicy {
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn bounded(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
        }
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Delay before the given 1-based attempt; doubles up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt.saturating_sub(2));
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms.max(self.initial_backoff_ms)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fail_fast()
    }
}

/// Session configuration, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub device_id: String,
    pub preferred_locale: String,
    pub version_string: String,
    pub system_info: String,
    pub early_failure_timeout_ms: u64,
    pub access_points: Vec<String>,
    pub time_sync: TimeSyncMethod,
    pub manual_time_offset_ms: i64,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4().simple().to_string(),
            preferred_locale: "en".into(),
            version_string: format!("connect-session {}", env!("CARGO_PKG_VERSION")),
            system_info: format!(
                "connect-session {}; {} {}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            early_failure_timeout_ms: 1000,
            access_points: vec![
                "ap.spotify.com:4070".into(),
                "ap.spotify.com:443".into(),
                "ap.spotify.com:80".into(),
            ],
            time_sync: TimeSyncMethod::Ping,
            manual_time_offset_ms: 0,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }
        if self.preferred_locale.len() != 2
            || !self.preferred_locale.bytes().all(|b| b.is_ascii_alphabetic())
        {
            return Err(ConfigError::InvalidLocale(self.preferred_locale.clone()));
        }
        if self.access_points.is_empty() {
            return Err(ConfigError::NoAccessPoints);
        }
        Ok(())
    }

    pub fn early_failure_timeout(&self) -> Duration {
        Duration::from_millis(self.early_failure_timeout_ms)
    }
}
