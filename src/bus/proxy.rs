//! Broker proxy: relays many publishers to many subscribers of one channel type.
//!
//! Publishers connect to the fan-in side and subscribers to the fan-out side,
//! so either may start first. The relay forwards everything unfiltered and
//! stops only when its control socket receives [`PROXY_TERMINATE`].

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::runtime::RuntimeShared;
use super::socket::LeasedSocket;
use super::topic::{ChannelMode, ChannelType, PROXY_TERMINATE};
use super::{BusError, Result};

/// Handle to a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    channel_type: ChannelType,
    stop: Sender<()>,
}

impl BrokerHandle {
    /// Channel type the broker relays.
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Stop the relay. Calling it again is a no-op.
    ///
    /// The broker cannot be restarted for this channel type afterwards.
    pub fn close(&self) {
        let _ = self.stop.try_send(());
    }
}

/// Start the broker for `channel_type`.
pub(crate) fn start_proxy(
    shared: &RuntimeShared,
    channel_type: ChannelType,
) -> Result<BrokerHandle> {
    let claim = shared
        .guards
        .try_claim(ChannelMode::ProxyControlPublish, channel_type)
        .ok_or(BusError::DuplicateChannel {
            mode: ChannelMode::ProxyControlPublish,
            channel_type,
        })?;

    let sockets = &shared.sockets;
    let fan_in = sockets.acquire_relay(ChannelMode::Publisher, channel_type, "broker/fan-in")?;
    let fan_out = sockets.acquire_relay(ChannelMode::Subscriber, channel_type, "broker/fan-out")?;
    let control = sockets.acquire(
        ChannelMode::ProxyControlSubscribe,
        channel_type,
        "broker/control",
    )?;
    control.set_subscribe(b"")?;
    let terminator = sockets.acquire(
        ChannelMode::ProxyControlPublish,
        channel_type,
        "broker/terminator",
    )?;

    let (stop_tx, stop_rx) = bounded(1);
    // Never sent on; dropped when the relay returns.
    let (done_tx, done_rx) = bounded::<()>(0);
    let resend_interval = shared.config.poll_interval();
    let resend_window = shared.config.drain_timeout();

    let companion_registration = shared
        .shutdown
        .register(format!("broker-control:{channel_type}"));
    let shutdown = shared.shutdown.listener();
    thread::Builder::new()
        .name(format!("telebus-broker-ctl-{channel_type}"))
        .spawn(move || {
            let _registration = companion_registration;
            run_terminator(
                terminator,
                channel_type,
                shutdown,
                stop_rx,
                done_rx,
                resend_interval,
                resend_window,
            );
        })?;

    let registration = shared.shutdown.register(format!("broker:{channel_type}"));
    thread::Builder::new()
        .name(format!("telebus-broker-{channel_type}"))
        .spawn(move || {
            let _registration = registration;
            let _done = done_tx;
            run_relay(fan_in, fan_out, control, channel_type);
        })?;

    claim.persist();
    Ok(BrokerHandle {
        channel_type,
        stop: stop_tx,
    })
}

fn run_relay(
    mut fan_in: LeasedSocket,
    mut fan_out: LeasedSocket,
    mut control: LeasedSocket,
    channel_type: ChannelType,
) {
    info!(%channel_type, "Broker relay started");
    match zmq::proxy_steerable(&mut fan_in, &mut fan_out, &mut control) {
        Ok(()) => info!(%channel_type, "Broker relay stopped"),
        Err(e) => error!(%channel_type, error = %e, "Broker relay failed"),
    }
}

fn run_terminator(
    terminator: LeasedSocket,
    channel_type: ChannelType,
    shutdown: Receiver<()>,
    stop: Receiver<()>,
    done: Receiver<()>,
    resend_interval: Duration,
    resend_window: Duration,
) {
    select! {
        recv(shutdown) -> _ => {}
        recv(done) -> _ => return,
        recv(stop) -> msg => {
            if msg.is_err() {
                // Every handle dropped; the broker runs until shutdown.
                select! {
                    recv(shutdown) -> _ => {}
                    recv(done) -> _ => return,
                }
            }
        }
    }

    // The control subscription may still be joining; repeat until the relay
    // is gone.
    let deadline = Instant::now() + resend_window;
    loop {
        match terminator.send(PROXY_TERMINATE, 0) {
            Ok(()) => debug!(%channel_type, "Broker terminate sent"),
            Err(e) => warn!(%channel_type, error = %e, "Failed to send broker terminate"),
        }
        select! {
            recv(done) -> _ => return,
            default(resend_interval) => {}
        }
        if Instant::now() >= deadline {
            warn!(%channel_type, "Broker relay did not acknowledge terminate");
            return;
        }
    }
}
