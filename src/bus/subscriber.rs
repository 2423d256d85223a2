//! Subscriber worker: forwards a subscribe socket onto an outbound queue.
//!
//! A blocking receive has no native cancellation, so every subscriber gets a
//! companion that owns a publish socket on the same channel type. On shutdown,
//! or when the subscription is closed, the companion publishes one message on
//! [`WAKEUP_TOPIC`], which the subscriber treats as "stop if stopping".
//! Receives are also polled in slices so a wake-up lost in a terminating
//! broker cannot wedge the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, info, warn};

use super::runtime::RuntimeShared;
use super::socket::{wait_readable, LeasedSocket, Readiness};
use super::topic::{ChannelMode, ChannelType, WAKEUP_TOPIC};
use super::{BusError, Result};

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Topic the message was published under.
    pub topic: String,
    /// Unmodified payload.
    pub payload: String,
}

impl Envelope {
    fn from_frames(mut frames: Vec<Vec<u8>>) -> Result<Self> {
        if frames.len() != 2 {
            return Err(BusError::InvalidPayload);
        }
        let payload = frames.pop().unwrap_or_default();
        let topic = frames.pop().unwrap_or_default();
        Ok(Self {
            topic: String::from_utf8(topic).map_err(|_| BusError::InvalidPayload)?,
            payload: String::from_utf8(payload).map_err(|_| BusError::InvalidPayload)?,
        })
    }
}

/// Stops one subscription. Cloneable; closing more than once is harmless.
///
/// Dropping every closer does not close the subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionCloser {
    closing: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl SubscriptionCloser {
    /// Ask the subscriber to stop. Its read handle disconnects shortly after.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.wake.try_send(());
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Start the subscriber for `channel_type`, filtering on `topic`.
pub(crate) fn start_subscriber(
    shared: &RuntimeShared,
    channel_type: ChannelType,
    topic: &str,
    outbound: Sender<Envelope>,
    owner: &str,
) -> Result<SubscriptionCloser> {
    let claim = shared
        .guards
        .try_claim(ChannelMode::Subscriber, channel_type)
        .ok_or(BusError::DuplicateChannel {
            mode: ChannelMode::Subscriber,
            channel_type,
        })?;

    let socket = shared
        .sockets
        .acquire(ChannelMode::Subscriber, channel_type, owner)?;
    socket.set_subscribe(topic.as_bytes())?;
    if !topic.is_empty() {
        socket.set_subscribe(WAKEUP_TOPIC.as_bytes())?;
    }
    let waker = shared.sockets.acquire(
        ChannelMode::Publisher,
        channel_type,
        &format!("{owner}/wakeup"),
    )?;

    let closing = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = bounded(1);
    // Never sent on; the main worker drops it on exit to release the companion.
    let (done_tx, done_rx) = bounded::<()>(0);

    let companion_registration = shared
        .shutdown
        .register(format!("subscriber-wakeup:{channel_type}:{owner}"));
    let shutdown = shared.shutdown.listener();
    thread::Builder::new()
        .name(format!("telebus-sub-wake-{channel_type}"))
        .spawn(move || {
            let _registration = companion_registration;
            run_wakeup(waker, channel_type, shutdown, wake_rx, done_rx);
        })?;

    let registration = shared
        .shutdown
        .register(format!("subscriber:{channel_type}:{owner}"));
    let stopping = {
        let closing = Arc::clone(&closing);
        let shutdown = Arc::clone(&shared.shutdown);
        move || closing.load(Ordering::SeqCst) || shutdown.is_signaled()
    };
    let listener = shared.shutdown.listener();
    let idle_timeout = shared.config.subscriber_idle_timeout();
    let poll_interval = shared.config.poll_interval();
    let topic_filter = topic.to_string();

    // If this spawn fails, dropping the closure drops `done_tx` and the
    // companion exits on its own.
    thread::Builder::new()
        .name(format!("telebus-sub-{channel_type}"))
        .spawn(move || {
            let _claim = claim;
            let _registration = registration;
            let _done = done_tx;
            info!(%channel_type, topic = %topic_filter, "Subscriber started");
            run_subscriber(
                socket,
                channel_type,
                outbound,
                listener,
                stopping,
                idle_timeout,
                poll_interval,
            );
            info!(%channel_type, topic = %topic_filter, "Subscriber stopped");
        })?;

    Ok(SubscriptionCloser {
        closing,
        wake: wake_tx,
    })
}

fn run_subscriber(
    socket: LeasedSocket,
    channel_type: ChannelType,
    outbound: Sender<Envelope>,
    shutdown: Receiver<()>,
    stopping: impl Fn() -> bool,
    idle_timeout: Duration,
    poll_interval: Duration,
) {
    loop {
        match wait_readable(&socket, poll_interval, None, &stopping) {
            Ok(Readiness::Readable) => {}
            Ok(Readiness::Stopped) => break,
            Ok(Readiness::TimedOut) => continue,
            Err(e) => {
                warn!(%channel_type, error = %e, "Subscriber poll failed");
                thread::sleep(poll_interval);
                continue;
            }
        }

        let frames = match socket.recv_multipart(0) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%channel_type, error = %e, "Subscriber receive failed");
                continue;
            }
        };
        let envelope = match Envelope::from_frames(frames) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%channel_type, error = %e, "Dropping malformed message");
                continue;
            }
        };

        if envelope.topic == WAKEUP_TOPIC {
            if stopping() {
                debug!(%channel_type, "Subscriber woken for shutdown");
                break;
            }
            continue;
        }

        select! {
            send(outbound, envelope) -> res => {
                if res.is_err() {
                    debug!(%channel_type, "Subscriber reader dropped");
                    break;
                }
            }
            recv(shutdown) -> _ => break,
            default(idle_timeout) => {
                info!(
                    %channel_type,
                    idle_ms = idle_timeout.as_millis() as u64,
                    "No reader within idle timeout, closing subscriber"
                );
                break;
            }
        }
    }
}

fn run_wakeup(
    waker: LeasedSocket,
    channel_type: ChannelType,
    shutdown: Receiver<()>,
    wake: Receiver<()>,
    done: Receiver<()>,
) {
    select! {
        recv(shutdown) -> _ => {}
        recv(done) -> _ => return,
        recv(wake) -> msg => {
            if msg.is_err() {
                // Every closer dropped; only shutdown or exit remain.
                select! {
                    recv(shutdown) -> _ => {}
                    recv(done) -> _ => return,
                }
            }
        }
    }

    if let Err(e) = waker.send_multipart([WAKEUP_TOPIC.as_bytes(), b"".as_slice()], 0) {
        warn!(%channel_type, error = %e, "Failed to publish wake-up");
    } else {
        debug!(%channel_type, "Wake-up published");
    }
}
