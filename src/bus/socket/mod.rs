//! Transport context and socket lifecycle.
//!
//! The [`SocketManager`] owns the single shared transport context, creates
//! every socket the bus uses, and keeps a registry of the ones still open.
//! Sockets are handed out as [`LeasedSocket`]s: dropping one closes the socket
//! and removes it from the registry.
//!
//! The termination barrier is a background thread started together with the
//! first context. Once shutdown is signaled it waits for the registry to
//! drain, then destroys the context. If no socket closes for a whole drain
//! timeout it gives up and leaves the context alive.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::shutdown::ShutdownCoordinator;
use super::topic::{ChannelMode, ChannelType, PortLayout};
use super::{BusError, Result};

/// Registry record of an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    /// Registry id, unique for the manager's lifetime.
    pub id: u64,
    /// Mode the socket was opened for.
    pub mode: ChannelMode,
    /// Channel type the socket belongs to.
    pub channel_type: ChannelType,
    /// Human-readable owner, used in logs.
    pub owner: String,
}

struct SocketState {
    context: Option<zmq::Context>,
    barrier_running: bool,
    sockets: BTreeMap<u64, SocketEntry>,
    next_id: u64,
}

/// Owns the transport context and the registry of open sockets.
pub(crate) struct SocketManager {
    layout: PortLayout,
    linger_ms: i32,
    drain_timeout: Duration,
    shutdown: Arc<ShutdownCoordinator>,
    state: Mutex<SocketState>,
    closed_tx: Sender<()>,
    closed_rx: Receiver<()>,
}

impl SocketManager {
    pub(crate) fn new(
        layout: PortLayout,
        linger: Duration,
        drain_timeout: Duration,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Arc<Self> {
        // One pending event is enough: the barrier re-reads the registry.
        let (closed_tx, closed_rx) = bounded(1);
        Arc::new(Self {
            layout,
            linger_ms: i32::try_from(linger.as_millis()).unwrap_or(i32::MAX),
            drain_timeout,
            shutdown,
            state: Mutex::new(SocketState {
                context: None,
                barrier_running: false,
                sockets: BTreeMap::new(),
                next_id: 1,
            }),
            closed_tx,
            closed_rx,
        })
    }

    /// Open a socket of the kind `mode` dictates, attached at its address.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        mode: ChannelMode,
        channel_type: ChannelType,
        owner: &str,
    ) -> Result<LeasedSocket> {
        let address = self.layout.address(mode, channel_type)?;
        self.open(
            mode.socket_type(),
            mode.is_connect(),
            &address,
            mode,
            channel_type,
            owner,
        )
    }

    /// Open one side of a broker relay, bound at the address of `mode`.
    ///
    /// The publisher side is the fan-in (XSUB) and the subscriber side the
    /// fan-out (XPUB).
    pub(crate) fn acquire_relay(
        self: &Arc<Self>,
        mode: ChannelMode,
        channel_type: ChannelType,
        owner: &str,
    ) -> Result<LeasedSocket> {
        let kind = match mode {
            ChannelMode::Publisher => zmq::XSUB,
            ChannelMode::Subscriber => zmq::XPUB,
            other => return Err(BusError::NoRelaySide(other)),
        };
        let address = self.layout.address(mode, channel_type)?;
        self.open(kind, false, &address, mode, channel_type, owner)
    }

    fn open(
        self: &Arc<Self>,
        kind: zmq::SocketType,
        connect: bool,
        address: &str,
        mode: ChannelMode,
        channel_type: ChannelType,
        owner: &str,
    ) -> Result<LeasedSocket> {
        let mut state = self.state.lock();
        if self.shutdown.is_signaled() {
            return Err(BusError::ShuttingDown);
        }

        let context = match state.context.clone() {
            Some(context) => context,
            None => {
                if !state.barrier_running {
                    self.spawn_barrier()?;
                    state.barrier_running = true;
                }
                let context = zmq::Context::new();
                state.context = Some(context.clone());
                info!("Transport context created");
                context
            }
        };

        let socket = context.socket(kind)?;
        socket.set_linger(self.linger_ms)?;
        if connect {
            socket.connect(address)?;
        } else {
            socket.bind(address)?;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.sockets.insert(
            id,
            SocketEntry {
                id,
                mode,
                channel_type,
                owner: owner.to_string(),
            },
        );
        drop(state);

        debug!(
            id,
            %mode,
            %channel_type,
            owner = %owner,
            address = %address,
            bind = !connect,
            "Socket opened"
        );

        Ok(LeasedSocket {
            socket,
            _lease: SocketLease {
                id,
                manager: Arc::clone(self),
            },
        })
    }

    fn release(&self, id: u64) {
        let removed = self.state.lock().sockets.remove(&id);
        if let Some(entry) = removed {
            debug!(
                id,
                mode = %entry.mode,
                channel_type = %entry.channel_type,
                owner = %entry.owner,
                "Socket closed"
            );
        }
        // Nobody listening is fine; the barrier re-reads the registry anyway.
        let _ = self.closed_tx.try_send(());
    }

    /// Snapshot of the sockets still open.
    pub(crate) fn live_sockets(&self) -> Vec<SocketEntry> {
        self.state.lock().sockets.values().cloned().collect()
    }

    /// Whether a transport context currently exists.
    pub(crate) fn has_context(&self) -> bool {
        self.state.lock().context.is_some()
    }

    fn spawn_barrier(self: &Arc<Self>) -> Result<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.listener();
        let closed = self.closed_rx.clone();
        let drain_timeout = self.drain_timeout;
        thread::Builder::new()
            .name("telebus-barrier".to_string())
            .spawn(move || run_barrier(manager, shutdown, closed, drain_timeout))?;
        Ok(())
    }

    /// Destroy the context if no socket is open. Returns whether it did.
    fn try_terminate(&self) -> bool {
        let mut state = self.state.lock();
        if !state.sockets.is_empty() {
            debug!(live = state.sockets.len(), "Waiting for sockets to close");
            return false;
        }
        if state.context.take().is_some() {
            info!("Transport context destroyed");
        }
        state.barrier_running = false;
        state.next_id = 1;
        true
    }

    fn abandon_termination(&self) {
        let leaked: Vec<String> = self
            .state
            .lock()
            .sockets
            .values()
            .map(|entry| format!("{}:{}:{}", entry.owner, entry.mode, entry.channel_type))
            .collect();
        warn!(
            ?leaked,
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "No socket closed within drain timeout, leaving transport context alive"
        );
        self.state.lock().barrier_running = false;
    }
}

fn run_barrier(
    manager: Weak<SocketManager>,
    shutdown: Receiver<()>,
    closed: Receiver<()>,
    drain_timeout: Duration,
) {
    // Closures before shutdown are irrelevant; just drain them.
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(closed) -> msg => {
                if msg.is_err() {
                    return;
                }
            }
        }
    }

    debug!("Termination barrier draining sockets");
    loop {
        let Some(current) = manager.upgrade() else {
            return;
        };
        if current.try_terminate() {
            return;
        }
        drop(current);

        select! {
            recv(closed) -> msg => {
                if msg.is_err() {
                    return;
                }
            }
            default(drain_timeout) => {
                if let Some(current) = manager.upgrade() {
                    current.abandon_termination();
                }
                return;
            }
        }
    }
}

struct SocketLease {
    id: u64,
    manager: Arc<SocketManager>,
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

/// A registered socket. Dropping it closes the socket, then deregisters it.
pub(crate) struct LeasedSocket {
    // Field order matters: the socket must close before the lease releases.
    socket: zmq::Socket,
    _lease: SocketLease,
}

impl Deref for LeasedSocket {
    type Target = zmq::Socket;

    fn deref(&self) -> &zmq::Socket {
        &self.socket
    }
}

impl DerefMut for LeasedSocket {
    fn deref_mut(&mut self) -> &mut zmq::Socket {
        &mut self.socket
    }
}

/// Outcome of waiting for a socket to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Readable,
    Stopped,
    TimedOut,
}

/// Wait until `socket` has a message, `stop` returns true, or `deadline` passes.
///
/// Polls in slices of `poll_interval` so the stop condition is re-checked even
/// when the wake-up message never arrives.
pub(crate) fn wait_readable(
    socket: &zmq::Socket,
    poll_interval: Duration,
    deadline: Option<Instant>,
    stop: impl Fn() -> bool,
) -> Result<Readiness> {
    loop {
        if stop() {
            return Ok(Readiness::Stopped);
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Readiness::TimedOut);
                }
                poll_interval.min(deadline - now)
            }
            None => poll_interval,
        };
        match socket.poll(zmq::POLLIN, slice.as_millis() as i64) {
            Ok(ready) if ready > 0 => return Ok(Readiness::Readable),
            Ok(_) | Err(zmq::Error::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
}
