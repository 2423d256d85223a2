//! Messaging core tunables.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::PortLayout;

/// Timeouts, queue depths and addressing for the messaging runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Host and base ports channel addresses are computed from.
    pub ports: PortLayout,
    /// How long a closing socket may keep flushing, in milliseconds.
    pub linger_ms: u64,
    /// Delay after a publisher connects before it sends anything.
    pub connect_settle_ms: u64,
    /// How long a subscriber waits for a reader before closing itself.
    pub subscriber_idle_timeout_ms: u64,
    /// How long the termination barrier waits for a socket to close before
    /// giving up on destroying the transport context.
    pub drain_timeout_ms: u64,
    /// How long a request waits for its reply.
    pub request_timeout_ms: u64,
    /// Granularity of blocking receives; stop conditions are checked this often.
    pub poll_interval_ms: u64,
    /// Capacity of a publish channel's write queue.
    pub publisher_queue_depth: usize,
    /// Capacity of a subscribe channel's read queue. Zero hands each message
    /// directly to a waiting reader.
    pub subscriber_queue_depth: usize,
    /// Capacity of a request handler's inbound and outbound queues.
    pub handler_queue_depth: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            ports: PortLayout::default(),
            linger_ms: 10,
            connect_settle_ms: 100,
            subscriber_idle_timeout_ms: 10_000,
            drain_timeout_ms: 1_000,
            request_timeout_ms: 5_000,
            poll_interval_ms: 100,
            publisher_queue_depth: 64,
            subscriber_queue_depth: 0,
            handler_queue_depth: 0,
        }
    }
}

impl MessagingConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn subscriber_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_idle_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Never zero, so pollers always yield.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
