// src/rabbitmq/channel_manager.rs
// Live-channel registry. Every channel handed out by the connection manager is
// tracked here until it closes, so shutdown and diagnostics can see them all.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::Result;
use super::transport::BrokerChannel;

/// A channel registered with a [`ChannelRegistry`]. Dereferences to the
/// underlying broker channel; closing it removes it from the registry.
pub struct ManagedChannel {
    id: String,
    inner: Arc<dyn BrokerChannel>,
    registry: Weak<ChannelRegistry>,
    closed: AtomicBool,
}

impl ManagedChannel {
    /// Channel identifier for logging
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.inner.is_open()
    }

    /// Closes the channel and deregisters it. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        if !self.inner.is_open() {
            debug!(channel_id = %self.id, "Channel already closed by the broker");
            return Ok(());
        }

        debug!(channel_id = %self.id, "Closing channel");
        self.inner.close().await
    }
}

impl Deref for ManagedChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<dyn BrokerChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, channel: Arc<dyn BrokerChannel>) -> Arc<ManagedChannel> {
        let id = format!("channel-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.lock().insert(id.clone(), Arc::clone(&channel));
        debug!(channel_id = %id, "Registered channel");

        Arc::new(ManagedChannel {
            id,
            inner: channel,
            registry: Arc::downgrade(self),
            closed: AtomicBool::new(false),
        })
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Number of live channels. Channels the broker closed on its own are
    /// pruned first.
    pub fn len(&self) -> usize {
        let mut channels = self.lock();
        channels.retain(|_, channel| channel.is_open());
        channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut channels = self.lock();
        channels.retain(|_, channel| channel.is_open());
        let mut ids: Vec<String> = channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forgets every channel without closing it; used when the connection
    /// they belonged to is gone.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Closes every registered channel, logging failures.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(String, Arc<dyn BrokerChannel>)> = self.lock().drain().collect();
        let count = drained.len();

        for (id, channel) in drained {
            if !channel.is_open() {
                continue;
            }
            if let Err(err) = channel.close().await {
                warn!(channel_id = %id, error = %err, "Failed to close channel");
            }
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn BrokerChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
