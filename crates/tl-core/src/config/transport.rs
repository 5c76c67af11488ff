//! Transport configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Settings for the streaming transport client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between heartbeats while connected
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Timeout for establishing the underlying connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Consecutive failed attempts before giving up (None = retry forever)
    pub max_retries: Option<u32>,

    /// Backoff between reconnection attempts
    pub backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}
