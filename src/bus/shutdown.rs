//! One-shot shutdown broadcast with registrant tracking.
//!
//! Every long-lived worker holds a [`ShutdownRegistration`] for as long as it
//! runs. [`ShutdownCoordinator::signal`] closes the broadcast channel, which
//! every [`ShutdownCoordinator::listener`] observes as a disconnect, and
//! [`ShutdownCoordinator::wait`] blocks until all registrations are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

/// Broadcasts an irreversible "go down" signal and tracks who still runs.
pub struct ShutdownCoordinator {
    signaled: AtomicBool,
    /// Dropped on signal; listeners see the disconnect.
    trigger: Mutex<Option<Sender<()>>>,
    listener: Receiver<()>,
    registrants: Mutex<HashMap<u64, String>>,
    drained: Condvar,
    next_id: AtomicU64,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not been signaled.
    pub fn new() -> Arc<Self> {
        let (trigger, listener) = bounded(0);
        Arc::new(Self {
            signaled: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            listener,
            registrants: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a running worker. Dropping the registration deregisters it.
    pub fn register(self: &Arc<Self>, tag: impl Into<String>) -> ShutdownRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tag = tag.into();
        debug!(registrant = %tag, "Registered for shutdown");
        self.registrants.lock().insert(id, tag);
        ShutdownRegistration {
            coordinator: Arc::clone(self),
            id,
        }
    }

    /// Receiver that becomes ready (disconnected) once shutdown is signaled.
    ///
    /// Use it in a `select!` arm; it never yields a value.
    pub fn listener(&self) -> Receiver<()> {
        self.listener.clone()
    }

    /// Whether shutdown has been signaled.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Broadcast shutdown. Calling it again is a no-op.
    pub fn signal(&self) {
        if self.signaled.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already signaled");
            return;
        }
        let registrants = self.registrants.lock().len();
        info!(registrants, "Shutdown signaled");
        drop(self.trigger.lock().take());
    }

    /// Number of registrations still alive.
    pub fn registrant_count(&self) -> usize {
        self.registrants.lock().len()
    }

    /// Block until every registrant has deregistered or `timeout` elapses.
    ///
    /// Returns `true` if everyone deregistered in time.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registrants = self.registrants.lock();
        while !registrants.is_empty() {
            if self.drained.wait_until(&mut registrants, deadline).timed_out() {
                if registrants.is_empty() {
                    break;
                }
                let pending: Vec<&String> = registrants.values().collect();
                warn!(?pending, "Shutdown wait timed out");
                return false;
            }
        }
        true
    }

    /// Signal shutdown, then [`wait`](Self::wait) for registrants.
    pub fn signal_and_wait(&self, timeout: Duration) -> bool {
        self.signal();
        self.wait(timeout)
    }

    fn deregister(&self, id: u64) {
        let mut registrants = self.registrants.lock();
        if let Some(tag) = registrants.remove(&id) {
            debug!(registrant = %tag, "Deregistered from shutdown");
        }
        if registrants.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// Live registration with a [`ShutdownCoordinator`].
#[must_use = "dropping the registration deregisters immediately"]
pub struct ShutdownRegistration {
    coordinator: Arc<ShutdownCoordinator>,
    id: u64,
}

impl Drop for ShutdownRegistration {
    fn drop(&mut self) {
        self.coordinator.deregister(self.id);
    }
}
