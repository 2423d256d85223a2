//! Broker binary configuration.

use std::time::Duration;

use serde::Deserialize;

/// Settings used only by the standalone broker process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Also answer `echo` requests with the request payload.
    pub serve_echo: bool,
    /// How long to wait for workers to drain on exit.
    pub shutdown_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            serve_echo: true,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl BrokerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
