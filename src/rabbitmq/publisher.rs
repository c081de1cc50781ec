// src/rabbitmq/publisher.rs
// Publish operations: queue, exchange (fanout/direct/topic) and broadcast,
// optionally waiting for a correlated reply.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::amqp_client::AmqpClient;
use super::channel_manager::ManagedChannel;
use super::correlation::{new_correlation_id, CorrelationRegistry};
use super::errors::{RabbitMQError, Result};
use super::transport::{
    DeliveryStream, ExchangeType, MessageProperties, QueueOptions, DEFAULT_REPLY_TO,
};
use crate::message::{MessagePayload, JSON_CONTENT_TYPE};

/// Where the consumer should send its reply, if anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReplyTo {
    #[default]
    None,
    /// The broker's direct reply-to pseudo-queue.
    Default,
    /// An existing queue.
    Queue(String),
}

impl ReplyTo {
    pub fn destination(&self) -> Option<&str> {
        match self {
            ReplyTo::None => None,
            ReplyTo::Default => Some(DEFAULT_REPLY_TO),
            ReplyTo::Queue(name) => Some(name),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ReplyTo::None)
    }
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Minted per request when absent.
    pub correlation_id: Option<String>,
    /// Declares the target durable and marks the message persistent.
    pub durable: bool,
    pub reply_to: ReplyTo,
    /// Only applies when a reply is expected.
    pub timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            correlation_id: None,
            durable: true,
            reply_to: ReplyTo::None,
            timeout: None,
        }
    }
}

impl SendOptions {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_reply_to(mut self, reply_to: ReplyTo) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn expect_reply(self) -> Self {
        self.with_reply_to(ReplyTo::Default)
    }

    /// A zero timeout means wait forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// No reply was requested; carries the message's correlation id.
    Published(String),
    /// The decoded body of the matching reply.
    Reply(Value),
}

impl SendOutcome {
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            SendOutcome::Published(id) => Some(id),
            SendOutcome::Reply(_) => None,
        }
    }

    pub fn into_reply(self) -> Option<Value> {
        match self {
            SendOutcome::Published(_) => None,
            SendOutcome::Reply(value) => Some(value),
        }
    }
}

enum Target<'a> {
    Queue(&'a str),
    Exchange {
        name: &'a str,
        kind: ExchangeType,
        routing_key: &'a str,
    },
}

impl AmqpClient {
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        self.send(Target::Queue(queue), payload, options).await
    }

    /// The routing key is ignored for fanout exchanges.
    pub async fn send_to_exchange(
        &self,
        exchange: &str,
        kind: ExchangeType,
        routing_key: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        let target = Target::Exchange {
            name: exchange,
            kind,
            routing_key,
        };
        self.send(target, payload, options).await
    }

    pub async fn send_to_direct_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        self.send_to_exchange(exchange, ExchangeType::Direct, routing_key, payload, options)
            .await
    }

    pub async fn send_to_topic(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        self.send_to_exchange(exchange, ExchangeType::Topic, routing_key, payload, options)
            .await
    }

    /// Publishes to a fanout exchange without waiting for replies and returns
    /// the message's correlation id. Any reply settings in `options` are
    /// ignored.
    pub async fn broadcast(
        &self,
        exchange: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<String> {
        let options = SendOptions {
            reply_to: ReplyTo::None,
            timeout: None,
            ..options
        };

        match self
            .send_to_exchange(exchange, ExchangeType::Fanout, "", payload, options)
            .await?
        {
            SendOutcome::Published(correlation_id) => Ok(correlation_id),
            SendOutcome::Reply(value) => Err(RabbitMQError::UnexpectedOutcome(format!(
                "broadcast to {} resolved with a reply instead of a correlation id: {}",
                exchange, value
            ))),
        }
    }

    async fn send(
        &self,
        target: Target<'_>,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        payload.validate()?;
        let body = payload.encode()?;

        let channel = self.create_channel().await?;
        let outcome = self.send_on(&channel, target, body, options).await;

        if let Err(err) = channel.close().await {
            warn!(channel_id = %channel.id(), error = %err, "Failed to close channel after publish");
        }
        outcome
    }

    async fn send_on(
        &self,
        channel: &Arc<ManagedChannel>,
        target: Target<'_>,
        body: Vec<u8>,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        let SendOptions {
            correlation_id,
            durable,
            reply_to,
            timeout,
        } = options;
        let correlation_id = correlation_id.unwrap_or_else(new_correlation_id);

        let (exchange, routing_key) = match target {
            Target::Queue(queue) => {
                channel
                    .assert_queue(
                        queue,
                        QueueOptions {
                            durable,
                            exclusive: false,
                        },
                    )
                    .await?;
                ("", queue)
            }
            Target::Exchange {
                name,
                kind,
                routing_key,
            } => {
                channel.assert_exchange(name, kind, durable).await?;
                let routing_key = if kind == ExchangeType::Fanout { "" } else { routing_key };
                (name, routing_key)
            }
        };

        let mut properties = MessageProperties::default()
            .with_content_type(JSON_CONTENT_TYPE)
            .with_correlation_id(correlation_id.clone())
            .with_persistent(durable);

        let Some(reply_queue) = reply_to.destination() else {
            debug!(
                channel_id = %channel.id(),
                exchange = %exchange,
                routing_key = %routing_key,
                correlation_id = %correlation_id,
                "Publishing message"
            );
            channel.publish(exchange, routing_key, &body, properties).await?;
            return Ok(SendOutcome::Published(correlation_id));
        };

        // Listen for the reply before publishing so a fast consumer cannot
        // answer before anyone is listening.
        let pending = self.correlations.register(&correlation_id)?;
        let replies = channel.consume(reply_queue, true).await?;
        let pump = tokio::spawn(pump_replies(
            replies,
            correlation_id.clone(),
            Arc::clone(&self.correlations),
        ));

        properties = properties.with_reply_to(reply_queue);
        debug!(
            channel_id = %channel.id(),
            exchange = %exchange,
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            reply_to = %reply_queue,
            "Publishing request"
        );
        if let Err(err) = channel.publish(exchange, routing_key, &body, properties).await {
            pump.abort();
            return Err(err);
        }

        let reply = pending.wait(timeout).await;
        pump.abort();

        match reply {
            Ok(bytes) => {
                debug!(correlation_id = %correlation_id, "Received reply");
                Ok(SendOutcome::Reply(serde_json::from_slice(&bytes)?))
            }
            Err(err) => {
                if err.is_timeout() {
                    warn!(
                        channel_id = %channel.id(),
                        correlation_id = %correlation_id,
                        "Timed out while waiting for response from consumer"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Hands the reply carrying `correlation_id` to its waiter; anything else
/// arriving on the reply queue is ignored.
async fn pump_replies(
    mut replies: DeliveryStream,
    correlation_id: String,
    correlations: Arc<CorrelationRegistry>,
) {
    while let Some(delivery) = replies.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(correlation_id = %correlation_id, error = %err, "Reply consumer failed");
                return;
            }
        };

        if delivery.properties.correlation_id.as_deref() != Some(correlation_id.as_str()) {
            debug!(
                expected = %correlation_id,
                received = ?delivery.properties.correlation_id,
                "Ignoring reply for another request"
            );
            continue;
        }

        correlations.resolve(&correlation_id, delivery.data);
        return;
    }
}
