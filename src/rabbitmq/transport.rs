// src/rabbitmq/transport.rs
// The broker primitives this crate is built on: connection, channel, publish,
// consume and ack/nack. Frame encoding and sockets live behind these traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::Result;

/// Well-known pseudo-queue reserved by the broker for direct reply-to.
pub const DEFAULT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Fanout,
    Topic,
    Direct,
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Direct => "direct",
        };
        f.write_str(kind)
    }
}

/// Metadata carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Out-of-band notifications raised by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Blocked(String),
    Unblocked,
    Closed(Option<String>),
    Error(String),
}

/// A freshly opened connection and the receiving end of its signals.
pub struct Established {
    pub connection: Arc<dyn BrokerConnection>,
    pub signals: mpsc::UnboundedReceiver<ConnectionSignal>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Established>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declares a queue and returns its name. An empty name asks the broker
    /// to generate one.
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn assert_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Maximum unacknowledged deliveries per consumer; 0 is unlimited.
    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}
