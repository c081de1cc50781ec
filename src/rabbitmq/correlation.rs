// src/rabbitmq/correlation.rs
// Pending reply waiters keyed by correlation id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};

type ReplySender = oneshot::Sender<Vec<u8>>;

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, (u64, ReplySender)>>,
    next_token: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a waiter for `correlation_id`. Only one waiter may be pending
    /// per id.
    pub fn register(self: &Arc<Self>, correlation_id: &str) -> Result<PendingReply> {
        let mut pending = self.lock();
        if pending.contains_key(correlation_id) {
            return Err(RabbitMQError::DuplicateCorrelationId(correlation_id.to_string()));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(correlation_id.to_string(), (token, tx));

        Ok(PendingReply {
            correlation_id: correlation_id.to_string(),
            token,
            receiver: rx,
            registry: Arc::clone(self),
        })
    }

    /// Hands `body` to the waiter for `correlation_id`. Returns false when no
    /// waiter matches, in which case the reply is ignored.
    pub fn resolve(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        let Some((_, sender)) = self.lock().remove(correlation_id) else {
            debug!(correlation_id = %correlation_id, "Ignoring reply with no pending request");
            return false;
        };
        sender.send(body).is_ok()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cancel(&self, correlation_id: &str, token: u64) {
        let mut pending = self.lock();
        if pending.get(correlation_id).is_some_and(|(t, _)| *t == token) {
            pending.remove(correlation_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, ReplySender)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The receiving half of a registered request. Dropping it withdraws the
/// registration.
pub struct PendingReply {
    correlation_id: String,
    token: u64,
    receiver: oneshot::Receiver<Vec<u8>>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the reply body. `None` waits indefinitely.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.receiver)
                .await
                .map_err(|_| RabbitMQError::Timeout(limit))?,
            None => (&mut self.receiver).await,
        };

        received.map_err(|_| {
            RabbitMQError::ConsumeError(format!(
                "reply waiter for {} was dropped before a response arrived",
                self.correlation_id
            ))
        })
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.cancel(&self.correlation_id, self.token);
    }
}
