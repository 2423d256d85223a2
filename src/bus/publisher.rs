//! Publisher worker: forwards an inbound queue onto a publish socket.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, info, warn};

use super::runtime::RuntimeShared;
use super::socket::LeasedSocket;
use super::topic::{ChannelMode, ChannelType};
use super::{BusError, Result};

/// Start the publisher for `channel_type`, publishing everything received on
/// `inbound` under `topic`.
///
/// The worker exits on shutdown or once every sender of `inbound` is dropped.
pub(crate) fn start_publisher(
    shared: &RuntimeShared,
    channel_type: ChannelType,
    topic: String,
    inbound: Receiver<String>,
    owner: &str,
) -> Result<()> {
    let claim = shared
        .guards
        .try_claim(ChannelMode::Publisher, channel_type)
        .ok_or(BusError::DuplicateChannel {
            mode: ChannelMode::Publisher,
            channel_type,
        })?;
    let socket = shared
        .sockets
        .acquire(ChannelMode::Publisher, channel_type, owner)?;

    let registration = shared
        .shutdown
        .register(format!("publisher:{channel_type}:{owner}"));
    let shutdown = shared.shutdown.listener();
    let settle = shared.config.connect_settle();

    thread::Builder::new()
        .name(format!("telebus-pub-{channel_type}"))
        .spawn(move || {
            let _claim = claim;
            let _registration = registration;
            run_publisher(socket, channel_type, &topic, inbound, shutdown, settle);
        })?;
    Ok(())
}

fn run_publisher(
    socket: LeasedSocket,
    channel_type: ChannelType,
    topic: &str,
    inbound: Receiver<String>,
    shutdown: Receiver<()>,
    settle: Duration,
) {
    // Connects complete asynchronously; anything sent before the handshake
    // is silently dropped by the transport.
    select! {
        recv(shutdown) -> _ => return,
        default(settle) => {}
    }

    info!(%channel_type, topic = %topic, "Publisher started");
    loop {
        select! {
            recv(shutdown) -> _ => {
                debug!(%channel_type, "Publisher observed shutdown");
                break;
            }
            recv(inbound) -> msg => match msg {
                Ok(payload) => {
                    if let Err(e) =
                        socket.send_multipart([topic.as_bytes(), payload.as_bytes()], 0)
                    {
                        warn!(
                            %channel_type,
                            topic = %topic,
                            error = %e,
                            "Publish failed, message dropped"
                        );
                    } else {
                        debug!(
                            %channel_type,
                            topic = %topic,
                            bytes = payload.len(),
                            "Published"
                        );
                    }
                }
                Err(_) => {
                    debug!(%channel_type, "Publisher inbound queue closed");
                    break;
                }
            }
        }
    }
    info!(%channel_type, "Publisher stopped");
}
