// src/rabbitmq/consumer.rs
// Consume operations: queue and exchange subscriptions that run a handler per
// delivery, reply when asked to and settle the delivery.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use futures_lite::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::amqp_client::AmqpClient;
use super::channel_manager::ManagedChannel;
use super::errors::{RabbitMQError, Result};
use super::transport::{Delivery, DeliveryStream, ExchangeType, MessageProperties, QueueOptions};
use crate::message::{MessagePayload, JSON_CONTENT_TYPE};

pub type HandlerResult = anyhow::Result<Option<MessagePayload>>;

type Handler = Arc<dyn Fn(String, MessagePayload) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Acknowledge deliveries after handling; off means the broker considers
    /// them settled on delivery.
    pub ack: bool,
    pub durable: bool,
    /// Maximum unacknowledged deliveries; 0 is unlimited.
    pub prefetch: u16,
    /// Close the channel after the first processed delivery.
    pub auto_close_channel: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            ack: true,
            durable: true,
            prefetch: 0,
            auto_close_channel: false,
        }
    }
}

impl ReceiveOptions {
    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_auto_close_channel(mut self, auto_close_channel: bool) -> Self {
        self.auto_close_channel = auto_close_channel;
        self
    }
}

/// A running consumer. Dropping it leaves the consumer running; call
/// [`Subscription::close`] to stop it.
pub struct Subscription {
    queue: String,
    channel: Arc<ManagedChannel>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// The queue being consumed; server-generated for exchange subscriptions.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn channel_id(&self) -> &str {
        self.channel.id()
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished() && self.channel.is_open()
    }

    pub async fn close(self) -> Result<()> {
        let closed = self.channel.close().await;
        self.task.abort();
        closed
    }
}

impl AmqpClient {
    pub async fn receive_from_queue<F, Fut>(
        &self,
        queue: &str,
        handler: F,
        options: ReceiveOptions,
    ) -> Result<Subscription>
    where
        F: Fn(MessagePayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |_routing_key: String, payload: MessagePayload| handler(payload).boxed());

        let channel = self.create_channel().await?;
        let setup = async {
            channel
                .assert_queue(
                    queue,
                    QueueOptions {
                        durable: options.durable,
                        exclusive: false,
                    },
                )
                .await?;
            channel.prefetch(options.prefetch).await?;
            channel.consume(queue, !options.ack).await
        }
        .await;

        start(channel, queue.to_string(), setup, handler, options).await
    }

    /// Binds a fresh exclusive queue to `exchange` under every key in
    /// `routing_keys` (the empty key when none are given) and consumes it.
    /// `options.durable` applies to the exchange; the queue lives only as
    /// long as the connection.
    pub async fn receive_from_exchange<F, Fut>(
        &self,
        exchange: &str,
        kind: ExchangeType,
        routing_keys: &[&str],
        handler: F,
        options: ReceiveOptions,
    ) -> Result<Subscription>
    where
        F: Fn(String, MessagePayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |routing_key: String, payload: MessagePayload| {
            handler(routing_key, payload).boxed()
        });

        let channel = self.create_channel().await?;
        let setup = async {
            channel
                .assert_exchange(exchange, kind, options.durable)
                .await?;
            let queue = channel
                .assert_queue(
                    "",
                    QueueOptions {
                        durable: false,
                        exclusive: true,
                    },
                )
                .await?;

            let keys: &[&str] = if routing_keys.is_empty() { &[""] } else { routing_keys };
            for key in keys {
                debug!(exchange = %exchange, queue = %queue, routing_key = %key, "Binding queue");
                channel.bind_queue(&queue, exchange, key).await?;
            }

            channel.prefetch(options.prefetch).await?;
            let deliveries = channel.consume(&queue, !options.ack).await?;
            Ok((queue, deliveries))
        }
        .await;

        match setup {
            Ok((queue, deliveries)) => start(channel, queue, Ok(deliveries), handler, options).await,
            Err(err) => start(channel, String::new(), Err(err), handler, options).await,
        }
    }

    /// Subscribes to a fanout exchange.
    pub async fn listen<F, Fut>(
        &self,
        exchange: &str,
        handler: F,
        options: ReceiveOptions,
    ) -> Result<Subscription>
    where
        F: Fn(String, MessagePayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.receive_from_exchange(exchange, ExchangeType::Fanout, &[], handler, options)
            .await
    }

    pub async fn receive_from_topic<F, Fut>(
        &self,
        exchange: &str,
        topics: &[&str],
        handler: F,
        options: ReceiveOptions,
    ) -> Result<Subscription>
    where
        F: Fn(String, MessagePayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.receive_from_exchange(exchange, ExchangeType::Topic, topics, handler, options)
            .await
    }

    pub async fn receive_from_direct_exchange<F, Fut>(
        &self,
        exchange: &str,
        routing_keys: &[&str],
        handler: F,
        options: ReceiveOptions,
    ) -> Result<Subscription>
    where
        F: Fn(String, MessagePayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.receive_from_exchange(exchange, ExchangeType::Direct, routing_keys, handler, options)
            .await
    }
}

async fn start(
    channel: Arc<ManagedChannel>,
    queue: String,
    setup: Result<DeliveryStream>,
    handler: Handler,
    options: ReceiveOptions,
) -> Result<Subscription> {
    let deliveries = match setup {
        Ok(deliveries) => deliveries,
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!(channel_id = %channel.id(), error = %close_err, "Failed to close channel");
            }
            return Err(err);
        }
    };

    info!(channel_id = %channel.id(), queue = %queue, "Consumer started, waiting for messages");
    let task = tokio::spawn(consume(
        Arc::clone(&channel),
        queue.clone(),
        deliveries,
        handler,
        options,
    ));

    Ok(Subscription {
        queue,
        channel,
        task,
    })
}

async fn consume(
    channel: Arc<ManagedChannel>,
    queue: String,
    mut deliveries: DeliveryStream,
    handler: Handler,
    options: ReceiveOptions,
) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => {
                let channel = Arc::clone(&channel);
                let handler = Arc::clone(&handler);

                tokio::spawn(async move {
                    handle_delivery(&channel, delivery, handler, options).await;
                    if options.auto_close_channel {
                        close_quietly(&channel).await;
                    }
                });
            }
            Err(err) => {
                error!(channel_id = %channel.id(), queue = %queue, error = %err, "Consumer failed");
                break;
            }
        }
    }

    debug!(channel_id = %channel.id(), queue = %queue, "Consumer stopped");
    if options.auto_close_channel {
        close_quietly(&channel).await;
    }
}

async fn handle_delivery(
    channel: &ManagedChannel,
    delivery: Delivery,
    handler: Handler,
    options: ReceiveOptions,
) {
    let Delivery {
        delivery_tag,
        routing_key,
        properties,
        data,
        ..
    } = delivery;

    if properties.content_type.as_deref() != Some(JSON_CONTENT_TYPE) {
        let err = RabbitMQError::ContentTypeMismatch {
            expected: JSON_CONTENT_TYPE.to_string(),
            found: properties.content_type.clone(),
        };
        warn!(
            channel_id = %channel.id(),
            delivery_tag,
            correlation_id = ?properties.correlation_id,
            error = %err,
            "Rejecting delivery"
        );
        return;
    }

    debug!(
        channel_id = %channel.id(),
        delivery_tag,
        routing_key = %routing_key,
        correlation_id = ?properties.correlation_id,
        "Handling delivery"
    );

    let outcome = match MessagePayload::decode(&data) {
        Ok(payload) => invoke(&handler, routing_key, payload).await,
        Err(err) => Err(anyhow::Error::new(err)),
    };

    match outcome {
        Ok(result) => {
            if let Some(reply_to) = &properties.reply_to {
                reply(channel, reply_to, &properties, result.unwrap_or_default()).await;
            }
            if options.ack {
                if let Err(err) = channel.ack(delivery_tag).await {
                    error!(channel_id = %channel.id(), delivery_tag, error = %err, "Failed to acknowledge message");
                }
            }
        }
        Err(err) => {
            warn!(
                channel_id = %channel.id(),
                delivery_tag,
                correlation_id = ?properties.correlation_id,
                error = %err,
                "Handler failed"
            );
            if let Some(reply_to) = &properties.reply_to {
                reply(channel, reply_to, &properties, MessagePayload::from_anyhow(&err)).await;
            }
            if options.ack {
                if let Err(err) = channel.nack(delivery_tag, false).await {
                    error!(channel_id = %channel.id(), delivery_tag, error = %err, "Failed to reject message");
                }
            }
        }
    }
}

/// Runs the handler, turning a panic into an ordinary handler error.
async fn invoke(handler: &Handler, routing_key: String, payload: MessagePayload) -> HandlerResult {
    match AssertUnwindSafe(handler(routing_key, payload)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(RabbitMQError::HandlerFailure(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))
        .into()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

async fn reply(
    channel: &ManagedChannel,
    reply_to: &str,
    request: &MessageProperties,
    payload: MessagePayload,
) {
    let payload = match payload.validate() {
        Ok(()) => payload,
        Err(err) => {
            error!(channel_id = %channel.id(), error = %err, "Handler produced an invalid reply");
            MessagePayload::from_error(&err)
        }
    };

    let body = match payload.encode() {
        Ok(body) => body,
        Err(err) => {
            error!(channel_id = %channel.id(), error = %err, "Failed to encode reply");
            return;
        }
    };

    let mut properties = MessageProperties::default().with_content_type(JSON_CONTENT_TYPE);
    if let Some(correlation_id) = &request.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone());
    }

    debug!(
        channel_id = %channel.id(),
        reply_to = %reply_to,
        correlation_id = ?request.correlation_id,
        "Sending reply"
    );
    if let Err(err) = channel.publish("", reply_to, &body, properties).await {
        error!(channel_id = %channel.id(), reply_to = %reply_to, error = %err, "Failed to send reply");
    }
}

async fn close_quietly(channel: &ManagedChannel) {
    if let Err(err) = channel.close().await {
        warn!(channel_id = %channel.id(), error = %err, "Failed to close channel");
    }
}
