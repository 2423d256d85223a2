//! The public entry point of the messaging core.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

use super::guard::ChannelGuards;
use super::proxy::{start_proxy, BrokerHandle};
use super::publisher::start_publisher;
use super::request::{send_request, PendingRequest, PendingResponse};
use super::response::register_handler;
use super::shutdown::ShutdownCoordinator;
use super::socket::{SocketEntry, SocketManager};
use super::subscriber::{start_subscriber, Envelope, SubscriptionCloser};
use super::topic::{resolve_topic, validate_pairing, ChannelMode, ChannelProducer, ChannelType};
use super::Result;
use crate::config::MessagingConfig;

/// State shared by the runtime and every worker it starts.
pub(crate) struct RuntimeShared {
    pub(crate) config: MessagingConfig,
    pub(crate) sockets: Arc<SocketManager>,
    pub(crate) shutdown: Arc<ShutdownCoordinator>,
    pub(crate) guards: ChannelGuards,
    pub(crate) dispatchers: Mutex<HashMap<ChannelType, Sender<PendingRequest>>>,
}

/// One messaging runtime per process.
///
/// Cheap to clone; all clones share the same transport context, sockets,
/// channel guards and shutdown coordinator.
#[derive(Clone)]
pub struct MessagingRuntime {
    shared: Arc<RuntimeShared>,
}

impl MessagingRuntime {
    /// Create a runtime with its own shutdown coordinator.
    pub fn new(config: MessagingConfig) -> Self {
        Self::with_shutdown(config, ShutdownCoordinator::new())
    }

    /// Create a runtime driven by an existing shutdown coordinator.
    pub fn with_shutdown(config: MessagingConfig, shutdown: Arc<ShutdownCoordinator>) -> Self {
        let sockets = SocketManager::new(
            config.ports.clone(),
            config.linger(),
            config.drain_timeout(),
            Arc::clone(&shutdown),
        );
        Self {
            shared: Arc::new(RuntimeShared {
                config,
                sockets,
                shutdown,
                guards: ChannelGuards::new(),
                dispatchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open the publish channel for `channel_type`.
    ///
    /// Every string sent on the returned queue is published under the
    /// producer's topic. Dropping every sender stops the publisher.
    pub fn open_publish_channel(
        &self,
        channel_type: ChannelType,
        producer: ChannelProducer,
        suffix: &str,
    ) -> Result<Sender<String>> {
        validate_pairing(ChannelMode::Publisher, channel_type)?;
        let topic = resolve_topic(producer, suffix)?;

        let (writer, inbound) = bounded(self.shared.config.publisher_queue_depth);
        let owner = format!("publisher:{topic}");
        start_publisher(&self.shared, channel_type, topic, inbound, &owner)?;
        Ok(writer)
    }

    /// Open the subscribe channel for `channel_type`, filtered on the
    /// producer's topic.
    ///
    /// The read handle disconnects when the subscriber stops: on shutdown,
    /// on [`SubscriptionCloser::close`], or after a message waited longer than
    /// the idle timeout for a reader.
    pub fn open_subscribe_channel(
        &self,
        channel_type: ChannelType,
        producer: ChannelProducer,
        suffix: &str,
    ) -> Result<(Receiver<Envelope>, SubscriptionCloser)> {
        validate_pairing(ChannelMode::Subscriber, channel_type)?;
        let topic = resolve_topic(producer, suffix)?;

        let (outbound, reader) = bounded(self.shared.config.subscriber_queue_depth);
        let owner = format!("subscriber:{topic}");
        let closer = start_subscriber(&self.shared, channel_type, &topic, outbound, &owner)?;
        Ok((reader, closer))
    }

    /// Run the broker relaying publishers to subscribers of `channel_type`.
    pub fn run_broker(&self, channel_type: ChannelType) -> Result<BrokerHandle> {
        validate_pairing(ChannelMode::ProxyControlPublish, channel_type)?;
        start_proxy(&self.shared, channel_type)
    }

    /// Send one request and get its eventual reply.
    ///
    /// Concurrent requests of the same type are queued and sent one at a time.
    pub fn send_request(
        &self,
        channel_type: ChannelType,
        payload: impl Into<String>,
    ) -> Result<PendingResponse> {
        validate_pairing(ChannelMode::Request, channel_type)?;
        send_request(&self.shared, channel_type, payload.into())
    }

    /// Serve requests of `channel_type`.
    ///
    /// Each value read from the first queue must be answered with exactly
    /// one value on the second before the next request arrives.
    pub fn register_request_handler(
        &self,
        channel_type: ChannelType,
    ) -> Result<(Receiver<String>, Sender<String>)> {
        validate_pairing(ChannelMode::Response, channel_type)?;
        register_handler(&self.shared, channel_type)
    }

    /// Whether no publisher, subscriber, broker or handler socket is open.
    ///
    /// Request sockets of cached dispatchers are not counted.
    pub fn is_messaging_idle(&self) -> bool {
        self.shared
            .sockets
            .live_sockets()
            .iter()
            .all(|entry| entry.mode == ChannelMode::Request)
    }

    /// Signal shutdown and wait up to `timeout` for every worker to exit.
    ///
    /// Returns `true` if all workers exited in time. Calling it again is safe.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.shared.shutdown.signal_and_wait(timeout);
        info!(drained, "Messaging runtime shut down");
        drained
    }

    /// The coordinator this runtime's workers register with.
    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shared.shutdown)
    }

    /// Snapshot of every open socket, for diagnostics.
    pub fn live_sockets(&self) -> Vec<SocketEntry> {
        self.shared.sockets.live_sockets()
    }

    /// Whether the shared transport context currently exists.
    pub fn has_transport_context(&self) -> bool {
        self.shared.sockets.has_context()
    }

    /// Messaging configuration this runtime was built with.
    pub fn config(&self) -> &MessagingConfig {
        &self.shared.config
    }
}
