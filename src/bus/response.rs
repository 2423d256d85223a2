//! Server request handler: exposes a response socket as a pair of queues.
//!
//! The worker strictly alternates: receive one request, forward it on the
//! inbound queue, wait for exactly one value on the outbound queue, send it
//! back. A companion request socket sends one dummy request on shutdown to
//! unblock the receive.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, info, warn};

use super::runtime::RuntimeShared;
use super::shutdown::ShutdownCoordinator;
use super::socket::{wait_readable, LeasedSocket, Readiness};
use super::topic::{ChannelMode, ChannelType};
use super::{BusError, Result};

/// Register the handler for `channel_type`.
///
/// Returns the inbound request queue and the outbound response sender.
/// Dropping either end shuts the handler down; the registration itself stays
/// for the life of the runtime.
pub(crate) fn register_handler(
    shared: &RuntimeShared,
    channel_type: ChannelType,
) -> Result<(Receiver<String>, Sender<String>)> {
    let claim = shared
        .guards
        .try_claim(ChannelMode::Response, channel_type)
        .ok_or(BusError::DuplicateHandler(channel_type))?;

    let socket = shared
        .sockets
        .acquire(ChannelMode::Response, channel_type, "handler")?;
    let waker = shared
        .sockets
        .acquire(ChannelMode::Request, channel_type, "handler/wakeup")?;

    let depth = shared.config.handler_queue_depth;
    let (inbound_tx, inbound_rx) = bounded(depth);
    let (outbound_tx, outbound_rx) = bounded(depth);
    // Never sent on; dropped when the main worker exits.
    let (done_tx, done_rx) = bounded::<()>(0);

    let companion_registration = shared
        .shutdown
        .register(format!("handler-wakeup:{channel_type}"));
    let listener = shared.shutdown.listener();
    thread::Builder::new()
        .name(format!("telebus-rep-wake-{channel_type}"))
        .spawn(move || {
            let _registration = companion_registration;
            run_wakeup(waker, channel_type, listener, done_rx);
        })?;

    let registration = shared
        .shutdown
        .register(format!("handler:{channel_type}"));
    let shutdown = Arc::clone(&shared.shutdown);
    let poll_interval = shared.config.poll_interval();
    thread::Builder::new()
        .name(format!("telebus-rep-{channel_type}"))
        .spawn(move || {
            let _registration = registration;
            let _done = done_tx;
            info!(%channel_type, "Request handler started");
            run_handler(
                socket,
                channel_type,
                inbound_tx,
                outbound_rx,
                &shutdown,
                poll_interval,
            );
            info!(%channel_type, "Request handler stopped");
        })?;

    claim.persist();
    Ok((inbound_rx, outbound_tx))
}

fn run_handler(
    socket: LeasedSocket,
    channel_type: ChannelType,
    inbound: Sender<String>,
    outbound: Receiver<String>,
    shutdown: &ShutdownCoordinator,
    poll_interval: Duration,
) {
    let listener = shutdown.listener();
    loop {
        match wait_readable(&socket, poll_interval, None, || shutdown.is_signaled()) {
            Ok(Readiness::Readable) => {}
            Ok(Readiness::Stopped) => break,
            Ok(Readiness::TimedOut) => continue,
            Err(e) => {
                warn!(%channel_type, error = %e, "Handler poll failed");
                thread::sleep(poll_interval);
                continue;
            }
        }

        let request = match socket.recv_string(0) {
            Ok(Ok(request)) => request,
            Ok(Err(_)) => {
                // The socket owes a reply before it can receive again.
                warn!(%channel_type, "Dropping non-UTF-8 request");
                if let Err(e) = socket.send("", 0) {
                    warn!(%channel_type, error = %e, "Failed to answer dropped request");
                }
                continue;
            }
            Err(e) => {
                warn!(%channel_type, error = %e, "Handler receive failed");
                continue;
            }
        };
        if shutdown.is_signaled() {
            debug!(%channel_type, "Handler woken for shutdown");
            break;
        }

        select! {
            send(inbound, request) -> res => {
                if res.is_err() {
                    debug!(%channel_type, "Handler inbound receiver dropped");
                    break;
                }
            }
            recv(listener) -> _ => break,
        }

        let response = select! {
            recv(outbound) -> msg => match msg {
                Ok(response) => response,
                Err(_) => {
                    debug!(%channel_type, "Handler outbound sender dropped");
                    break;
                }
            },
            recv(listener) -> _ => break,
        };
        if let Err(e) = socket.send(response.as_str(), 0) {
            warn!(%channel_type, error = %e, "Failed to send response");
        }
    }
}

fn run_wakeup(
    waker: LeasedSocket,
    channel_type: ChannelType,
    shutdown: Receiver<()>,
    done: Receiver<()>,
) {
    select! {
        recv(shutdown) -> _ => {}
        recv(done) -> _ => return,
    }
    match waker.send("", 0) {
        Ok(()) => debug!(%channel_type, "Handler wake-up sent"),
        Err(e) => warn!(%channel_type, error = %e, "Failed to send handler wake-up"),
    }
}
