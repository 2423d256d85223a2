//! Process-wide uniqueness of channel workers.
//!
//! A claim on `(mode, channel_type)` is taken atomically before a worker
//! starts and released when the [`ChannelClaim`] drops, unless the claim was
//! made permanent with [`ChannelClaim::persist`].

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::topic::{ChannelMode, ChannelType};

type GuardKey = (ChannelMode, ChannelType);

/// Set of open `(mode, channel_type)` pairs.
#[derive(Clone, Default)]
pub(crate) struct ChannelGuards {
    open: Arc<Mutex<HashSet<GuardKey>>>,
}

impl ChannelGuards {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Test-and-set. Returns `None` if the pair is already claimed.
    pub(crate) fn try_claim(
        &self,
        mode: ChannelMode,
        channel_type: ChannelType,
    ) -> Option<ChannelClaim> {
        let key = (mode, channel_type);
        if !self.open.lock().insert(key) {
            return None;
        }
        debug!(%mode, %channel_type, "Channel claimed");
        Some(ChannelClaim {
            guards: self.clone(),
            key,
            persistent: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_claimed(&self, mode: ChannelMode, channel_type: ChannelType) -> bool {
        self.open.lock().contains(&(mode, channel_type))
    }

    fn release(&self, key: GuardKey) {
        if self.open.lock().remove(&key) {
            debug!(mode = %key.0, channel_type = %key.1, "Channel released");
        }
    }
}

/// Exclusive right to run the worker for one `(mode, channel_type)` pair.
pub(crate) struct ChannelClaim {
    guards: ChannelGuards,
    key: GuardKey,
    persistent: bool,
}

impl ChannelClaim {
    /// Keep the pair claimed for the rest of the runtime's life.
    pub(crate) fn persist(mut self) {
        self.persistent = true;
    }
}

impl Drop for ChannelClaim {
    fn drop(&mut self) {
        if !self.persistent {
            self.guards.release(self.key);
        }
    }
}
