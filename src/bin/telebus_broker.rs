//! telebus-broker: standalone broker process
//!
//! Runs the relay for every publish/subscribe channel type so publishers and
//! subscribers in other processes can find each other, and optionally
//! answers `echo` requests as a liveness check.
//!
//! ## Configuration
//! - TELEBUS_CONFIG: Path to a YAML config file (optional)
//! - TELEBUS__*: Overrides, e.g. TELEBUS__BROKER__SERVE_ECHO=false
//! - TELEBUS_LOG: Log filter (default: info)

use tracing::{info, warn};

use telebus::bus::{ChannelType, MessagingRuntime};
use telebus::config::Config;
use telebus::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let runtime = MessagingRuntime::new(config.messaging.clone());

    let mut brokers = Vec::new();
    for channel_type in ChannelType::pubsub_types() {
        brokers.push(runtime.run_broker(channel_type)?);
        info!(%channel_type, "Broker running");
    }

    if config.broker.serve_echo {
        let (requests, responses) = runtime.register_request_handler(ChannelType::Echo)?;
        tokio::task::spawn_blocking(move || {
            for request in requests.iter() {
                if responses.send(request).is_err() {
                    break;
                }
            }
        });
        info!("Echo responder running");
    }

    info!(host = %config.messaging.ports.host, "telebus-broker started");
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    let timeout = config.broker.shutdown_timeout();
    let drained = tokio::task::spawn_blocking(move || runtime.shutdown(timeout)).await?;
    if !drained {
        warn!(?timeout, "Some workers did not stop in time");
    }
    drop(brokers);
    Ok(())
}
