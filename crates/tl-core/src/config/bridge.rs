//! Bridge configuration

use serde::{Deserialize, Serialize};

use super::{PtyConfig, TransportConfig};

/// Top-level configuration for one bridge session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Remote peer address.
    ///
    /// `http://` selects gRPC; `tcp://` selects framed TCP.
    pub endpoint: String,

    /// Session identifier (generated by the host when absent)
    pub session_id: Option<String>,

    /// Transport settings
    pub transport: TransportConfig,

    /// PTY defaults
    pub pty: PtyConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50051".to_string(),
            session_id: None,
            transport: TransportConfig::default(),
            pty: PtyConfig::default(),
        }
    }
}
