// src/rabbitmq/lapin_transport.rs
// Production transport: the broker primitives backed by lapin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    ConnectionStatus, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::Result;
use super::transport::{
    BrokerChannel, BrokerConnection, ConnectionSignal, Delivery, DeliveryStream, Established,
    ExchangeType, MessageProperties, QueueOptions, Transport,
};

/// lapin reports errors through a callback but blocked/closed transitions only
/// through its status object, which is polled at this interval.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management tools.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn connection_properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, url: &str) -> Result<Established> {
        let connection = Connection::connect(url, self.connection_properties()).await?;
        info!("Connected to RabbitMQ at {}", url);

        let (signals, receiver) = mpsc::unbounded_channel();

        let errors = signals.clone();
        connection.on_error(move |err| {
            let _ = errors.send(ConnectionSignal::Error(err.to_string()));
        });

        tokio::spawn(watch_status(connection.status().clone(), signals));

        Ok(Established {
            connection: Arc::new(LapinConnection { inner: connection }),
            signals: receiver,
        })
    }
}

async fn watch_status(status: ConnectionStatus, signals: mpsc::UnboundedSender<ConnectionSignal>) {
    let mut blocked = false;
    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);

    loop {
        ticker.tick().await;

        if signals.is_closed() {
            break;
        }

        if !status.connected() {
            let _ = signals.send(ConnectionSignal::Closed(None));
            break;
        }

        let now_blocked = status.blocked();
        if now_blocked != blocked {
            blocked = now_blocked;
            let signal = if blocked {
                ConnectionSignal::Blocked("connection blocked by broker".to_string())
            } else {
                ConnectionSignal::Unblocked
            };
            let _ = signals.send(signal);
        }
    }

    debug!("Stopped watching lapin connection status");
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "Closing connection").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(queue.name().as_str().to_string())
    }

    async fn assert_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        let kind = match kind {
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Direct => ExchangeKind::Direct,
        };

        self.inner
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &format!("consumer-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(Into::into))
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            warn!(channel = self.inner.id(), "Channel already closed");
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "Closing channel").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_delivery_mode(if properties.persistent { 2 } else { 1 })
        .with_timestamp(chrono::Utc::now().timestamp() as u64);

    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    basic
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let text = |value: &Option<lapin::types::ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: MessageProperties {
            content_type: text(properties.content_type()),
            correlation_id: text(properties.correlation_id()),
            reply_to: text(properties.reply_to()),
            persistent: *properties.delivery_mode() == Some(2),
        },
        data: delivery.data,
    }
}
