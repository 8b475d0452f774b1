//! Router configuration. Deserialisable so hosts can embed it in their own config file.

use std::time::Duration;

use serde::Deserialize;

use crate::dedup::DEFAULT_HISTORY_LEN;

/// What the inbound queue does when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued payload to admit the new one.
    DropOldest,
    /// Keep the queue as is and discard the new payload.
    DropNewest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropOldest
    }
}

/// Router tunables. Missing fields take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Dedup window capacity (default 256).
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Inbound queue capacity (default 1024).
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Per-session outbound queue depth (default 64).
    #[serde(default = "default_outbound_queue_len")]
    pub outbound_queue_len: usize,
    /// Bound on a single endpoint write, in milliseconds (default 5000).
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Largest payload accepted by `submit_outbound` (default 64 KiB).
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
    /// Rebroadcast a frame back to the session it arrived on (default false).
    #[serde(default)]
    pub echo_to_origin: bool,
}

fn default_history_len() -> usize {
    DEFAULT_HISTORY_LEN
}
fn default_inbox_capacity() -> usize {
    1024
}
fn default_outbound_queue_len() -> usize {
    64
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_max_payload_len() -> usize {
    64 * 1024
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_len: default_history_len(),
            inbox_capacity: default_inbox_capacity(),
            overflow_policy: OverflowPolicy::default(),
            outbound_queue_len: default_outbound_queue_len(),
            write_timeout_ms: default_write_timeout_ms(),
            max_payload_len: default_max_payload_len(),
            echo_to_origin: false,
        }
    }
}

impl RouterConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reject settings that would make a collection unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_len == 0 {
            return Err(ConfigError::ZeroCapacity("history_len"));
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("inbox_capacity"));
        }
        if self.outbound_queue_len == 0 {
            return Err(ConfigError::ZeroCapacity("outbound_queue_len"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::ZeroCapacity("write_timeout_ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}
