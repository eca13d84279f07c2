//! Bridge configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the command bridge.
///
/// Supplied once at [`Bridge::new`](crate::Bridge::new); the listening
/// address is fixed for the lifetime of the bridge.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BridgeConfig {
    /// Host the socket server binds to.
    pub host: String,
    /// Port the socket server binds to. Port 0 picks an ephemeral port.
    pub port: u16,
    /// Default seconds to wait for a command response.
    pub command_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9223,
            command_timeout_secs: 10,
        }
    }
}

impl BridgeConfig {
    /// Bind address string (`host:port`).
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
