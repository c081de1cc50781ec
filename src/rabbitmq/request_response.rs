// src/rabbitmq/request_response.rs
// Request/response policy over AmqpClient: every send expects a reply and the
// reply must be a well-formed envelope.

use std::future::Future;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::amqp_client::AmqpClient;
use super::consumer::{HandlerResult, ReceiveOptions, Subscription};
use super::errors::{RabbitMQError, Result};
use super::publisher::{ReplyTo, SendOptions, SendOutcome};
use super::transport::ExchangeType;
use crate::message::MessagePayload;

#[derive(Clone)]
pub struct RpcClient {
    client: AmqpClient,
    default_timeout: Option<Duration>,
}

impl RpcClient {
    pub fn new(client: AmqpClient) -> Self {
        Self {
            client,
            default_timeout: None,
        }
    }

    /// Timeout applied to requests whose options do not set one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn client(&self) -> &AmqpClient {
        &self.client
    }

    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<MessagePayload> {
        let outcome = self
            .client
            .send_to_queue(queue, payload, self.prepare(options))
            .await?;
        validate_reply(outcome)
    }

    pub async fn send_to_exchange(
        &self,
        exchange: &str,
        kind: ExchangeType,
        routing_key: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<MessagePayload> {
        let outcome = self
            .client
            .send_to_exchange(exchange, kind, routing_key, payload, self.prepare(options))
            .await?;
        validate_reply(outcome)
    }

    pub async fn send_to_direct_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<MessagePayload> {
        self.send_to_exchange(exchange, ExchangeType::Direct, routing_key, payload, options)
            .await
    }

    pub async fn send_to_topic(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &MessagePayload,
        options: SendOptions,
    ) -> Result<MessagePayload> {
        self.send_to_exchange(exchange, ExchangeType::Topic, routing_key, payload, options)
            .await
    }

    /// Sends `request` as the envelope's data and deserializes the reply's
    /// data. An error envelope comes back as `HandlerFailure`.
    pub async fn call<T: Serialize, R: DeserializeOwned>(&self, queue: &str, request: &T) -> Result<R> {
        let payload = MessagePayload::from_serialize(request)?;
        let reply = self
            .send_to_queue(queue, &payload, SendOptions::default())
            .await?;

        match reply.into_result() {
            Ok(data) => Ok(serde_json::from_value(data)?),
            Err(remote) => Err(RabbitMQError::HandlerFailure(remote.to_string())),
        }
    }

    fn prepare(&self, mut options: SendOptions) -> SendOptions {
        if options.reply_to.is_none() {
            options.reply_to = ReplyTo::Default;
        }
        if options.timeout.is_none() {
            options.timeout = self.default_timeout;
        }
        options
    }
}

fn validate_reply(outcome: SendOutcome) -> Result<MessagePayload> {
    match outcome {
        SendOutcome::Reply(value) => MessagePayload::from_value(value).map_err(|err| match err {
            RabbitMQError::InvalidPayload(reason) => {
                debug!(reason = %reason, "Rejecting malformed reply");
                RabbitMQError::InvalidReply(reason)
            }
            other => other,
        }),
        SendOutcome::Published(correlation_id) => Err(RabbitMQError::UnexpectedOutcome(format!(
            "request {} was published without waiting for a reply",
            correlation_id
        ))),
    }
}

/// The serving side. Consume behaviour is exactly that of [`AmqpClient`].
#[derive(Clone)]
pub struct RpcServer {
    client: AmqpClient,
}

impl RpcServer {
    pub fn new(client: AmqpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &AmqpClient {
        &self.client
    }

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
        self.client.receive_from_queue(queue, handler, options).await
    }

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
        self.client
            .receive_from_exchange(exchange, kind, routing_keys, handler, options)
            .await
    }

    pub async fn listen<F, Fut>(&self, exchange: &str, handler: F, options: ReceiveOptions) -> Result<Subscription>
    where
        F: Fn(String, MessagePayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.client.listen(exchange, handler, options).await
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
        self.client
            .receive_from_topic(exchange, topics, handler, options)
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
        self.client
            .receive_from_direct_exchange(exchange, routing_keys, handler, options)
            .await
    }
}
