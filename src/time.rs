//! Server clock offset tracking.
//!
//! A [`TimeProvider`] is owned by whoever builds the session and shared by
//! handle with every component that needs server-aligned time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSyncMethod {
    /// Offset follows the timestamp carried by every server ping.
    Ping,
    /// Fixed offset taken from configuration; pings are ignored.
    Manual,
    /// Local clock only.
    Disabled,
}

#[derive(Debug)]
pub struct TimeProvider {
    method: TimeSyncMethod,
    offset_ms: AtomicI64,
}

impl TimeProvider {
    pub fn new(method: TimeSyncMethod, manual_offset_ms: i64) -> Self {
        let initial = match method {
            TimeSyncMethod::Manual => manual_offset_ms,
            _ => 0,
        };
        Self {
            method,
            offset_ms: AtomicI64::new(initial),
        }
    }

    pub fn method(&self) -> TimeSyncMethod {
        self.method
    }

    pub fn offset_millis(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Local wall clock in milliseconds, corrected by the current offset.
    pub fn current_time_millis(&self) -> i64 {
        local_millis() + self.offset_millis()
    }

    /// Feeds the raw payload of a `Ping` packet: a big-endian u32 of server
    /// seconds.
    pub fn on_server_ping(&self, payload: &[u8]) -> Result<(), SessionError> {
        let seconds: [u8; 4] = payload
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| SessionError::protocol("ping payload shorter than 4 bytes"))?;
        if self.method != TimeSyncMethod::Ping {
            return Ok(());
        }
        let server_ms = u32::from_be_bytes(seconds) as i64 * 1000;
        let diff = server_ms - local_millis();
        self.offset_ms.store(diff, Ordering::Release);
        tracing::debug!(offset_ms = diff, "loaded time offset from ping");
        Ok(())
    }
}

impl Default for TimeProvider {
    fn default() -> Self {
        Self::new(TimeSyncMethod::Ping, 0)
    }
}

fn local_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
