//! Client request dispatcher.
//!
//! One worker per request type owns the request socket and serves a FIFO
//! queue of [`PendingRequest`]s, one in flight at a time. Callers get a
//! [`PendingResponse`] they can `.await` or block on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::runtime::RuntimeShared;
use super::shutdown::ShutdownCoordinator;
use super::socket::{wait_readable, LeasedSocket, Readiness};
use super::topic::{ChannelMode, ChannelType};
use super::{BusError, Result};

/// A single request waiting for the dispatcher. Used exactly once.
pub(crate) struct PendingRequest {
    payload: String,
    reply: oneshot::Sender<Result<String>>,
}

/// The eventual reply to a request.
///
/// Resolves to the reply payload, or to the error that ended the exchange.
/// If the dispatcher goes away first it resolves to [`BusError::ChannelClosed`].
#[derive(Debug)]
pub struct PendingResponse {
    channel_type: ChannelType,
    reply: oneshot::Receiver<Result<String>>,
}

impl PendingResponse {
    /// Request type this response belongs to.
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Block the current thread until the reply arrives.
    ///
    /// Must not be called from inside an async runtime; `.await` instead.
    pub fn wait(self) -> Result<String> {
        self.reply
            .blocking_recv()
            .unwrap_or(Err(BusError::ChannelClosed))
    }
}

impl Future for PendingResponse {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BusError::ChannelClosed)))
    }
}

/// Queue `payload` on the dispatcher for `channel_type`, starting it if needed.
pub(crate) fn send_request(
    shared: &RuntimeShared,
    channel_type: ChannelType,
    payload: String,
) -> Result<PendingResponse> {
    if shared.shutdown.is_signaled() {
        return Err(BusError::ShuttingDown);
    }
    let submit = get_or_create_dispatcher(shared, channel_type)?;

    let (reply, receiver) = oneshot::channel();
    submit
        .send(PendingRequest { payload, reply })
        .map_err(|_| BusError::ShuttingDown)?;
    Ok(PendingResponse {
        channel_type,
        reply: receiver,
    })
}

/// Cached submit queue for `channel_type`.
///
/// Cache entries live as long as the runtime, even after their worker exits;
/// submitting to an exited worker fails with [`BusError::ShuttingDown`].
fn get_or_create_dispatcher(
    shared: &RuntimeShared,
    channel_type: ChannelType,
) -> Result<Sender<PendingRequest>> {
    let mut dispatchers = shared.dispatchers.lock();
    if let Some(submit) = dispatchers.get(&channel_type) {
        return Ok(submit.clone());
    }

    let socket = shared
        .sockets
        .acquire(ChannelMode::Request, channel_type, "dispatcher")?;
    // A timed-out request must not wedge the socket, and a late reply to it
    // must not be mistaken for the next one.
    socket.set_req_relaxed(true)?;
    socket.set_req_correlate(true)?;

    let (submit, queue) = unbounded();
    let registration = shared
        .shutdown
        .register(format!("dispatcher:{channel_type}"));
    let shutdown = Arc::clone(&shared.shutdown);
    let timing = ExchangeTiming {
        request_timeout: shared.config.request_timeout(),
        poll_interval: shared.config.poll_interval(),
    };

    thread::Builder::new()
        .name(format!("telebus-req-{channel_type}"))
        .spawn(move || {
            let _registration = registration;
            run_dispatcher(socket, channel_type, queue, &shutdown, timing);
        })?;

    info!(%channel_type, "Request dispatcher started");
    dispatchers.insert(channel_type, submit.clone());
    Ok(submit)
}

#[derive(Clone, Copy)]
struct ExchangeTiming {
    request_timeout: Duration,
    poll_interval: Duration,
}

fn run_dispatcher(
    socket: LeasedSocket,
    channel_type: ChannelType,
    queue: Receiver<PendingRequest>,
    shutdown: &ShutdownCoordinator,
    timing: ExchangeTiming,
) {
    let listener = shutdown.listener();
    loop {
        select! {
            recv(listener) -> _ => break,
            recv(queue) -> msg => match msg {
                Ok(request) => {
                    let result = exchange(&socket, channel_type, &request.payload, shutdown, timing);
                    if let Err(e) = &result {
                        warn!(%channel_type, error = %e, "Request failed");
                    }
                    if request.reply.send(result).is_err() {
                        debug!(%channel_type, "Requester went away before the reply");
                    }
                }
                Err(_) => break,
            }
        }
    }

    drop(socket);
    for request in queue.try_iter() {
        let _ = request.reply.send(Err(BusError::ShuttingDown));
    }
    info!(%channel_type, "Request dispatcher stopped");
}

fn exchange(
    socket: &zmq::Socket,
    channel_type: ChannelType,
    payload: &str,
    shutdown: &ShutdownCoordinator,
    timing: ExchangeTiming,
) -> Result<String> {
    socket.send(payload, 0)?;
    debug!(%channel_type, bytes = payload.len(), "Request sent");

    let deadline = Instant::now() + timing.request_timeout;
    match wait_readable(socket, timing.poll_interval, Some(deadline), || {
        shutdown.is_signaled()
    })? {
        Readiness::Readable => socket
            .recv_string(0)?
            .map_err(|_| BusError::InvalidPayload),
        Readiness::TimedOut => Err(BusError::RequestTimeout(channel_type)),
        Readiness::Stopped => Err(BusError::ShuttingDown),
    }
}
