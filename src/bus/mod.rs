//! Telemetry messaging core.
//!
//! This module contains:
//! - Topic and address model (`topic`)
//! - Transport context and socket lifecycle (`socket`)
//! - Shutdown broadcast (`shutdown`)
//! - Channel workers: publisher, subscriber, broker proxy, request
//!   dispatcher and response handler
//! - `MessagingRuntime`: the public entry point tying them together

mod guard;
mod proxy;
mod publisher;
mod request;
mod response;
mod runtime;
mod socket;
mod subscriber;

pub mod shutdown;
pub mod topic;

// Re-exports
pub use proxy::BrokerHandle;
pub use request::PendingResponse;
pub use runtime::MessagingRuntime;
pub use shutdown::{ShutdownCoordinator, ShutdownRegistration};
pub use socket::SocketEntry;
pub use subscriber::{Envelope, SubscriptionCloser};
pub use topic::{
    resolve_address, resolve_topic, ChannelMode, ChannelProducer, ChannelType, PortLayout,
};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid producer: {0}")]
    InvalidProducer(String),

    #[error("Producer '{producer}' requires a non-empty suffix")]
    MissingSuffix { producer: ChannelProducer },

    #[error("Invalid channel type: {0}")]
    InvalidChannelType(String),

    #[error("A {mode} channel for '{channel_type}' is already open")]
    DuplicateChannel {
        mode: ChannelMode,
        channel_type: ChannelType,
    },

    #[error("The {0} mode has no broker relay side")]
    NoRelaySide(ChannelMode),

    #[error("Port offset {0} pushes a base port past 65535")]
    PortOffsetOverflow(u16),

    #[error("A handler for '{0}' is already registered")]
    DuplicateHandler(ChannelType),

    #[error("Messaging is shutting down")]
    ShuttingDown,

    #[error("Transport error: {0}")]
    Transport(#[from] zmq::Error),

    #[error("Request on '{0}' timed out waiting for a reply")]
    RequestTimeout(ChannelType),

    #[error("Received payload is not valid UTF-8")]
    InvalidPayload,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_channel() {
        let err = BusError::DuplicateChannel {
            mode: ChannelMode::Subscriber,
            channel_type: ChannelType::Counters,
        };
        assert_eq!(
            err.to_string(),
            "A subscriber channel for 'counters' is already open"
        );
        assert_eq!(
            BusError::MissingSuffix {
                producer: ChannelProducer::Plugin
            }
            .to_string(),
            "Producer 'plugin' requires a non-empty suffix"
        );
    }

    #[test]
    fn test_layout_errors_name_the_cause() {
        assert_eq!(
            BusError::NoRelaySide(ChannelMode::Response).to_string(),
            "The response mode has no broker relay side"
        );
        assert_eq!(
            BusError::PortOffsetOverflow(60000).to_string(),
            "Port offset 60000 pushes a base port past 65535"
        );
    }

    #[test]
    fn test_transport_error_converts() {
        let err: BusError = zmq::Error::EADDRINUSE.into();
        assert!(matches!(err, BusError::Transport(zmq::Error::EADDRINUSE)));
    }
}
