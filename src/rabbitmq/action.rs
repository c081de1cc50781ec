// src/rabbitmq/action.rs
// Adapters that turn typed async actions into consume handlers.
//
// Each adapter re-raises an incoming error envelope as a handler failure and
// wraps the action's return value in a success envelope.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::consumer::HandlerResult;
use super::errors::RabbitMQError;
use crate::message::MessagePayload;

/// Runs `action` without looking at the payload's data.
pub fn invoke_action<F, Fut, R>(
    action: F,
) -> impl Fn(MessagePayload) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Serialize,
{
    let action = Arc::new(action);
    move |payload: MessagePayload| -> BoxFuture<'static, HandlerResult> {
        let action = Arc::clone(&action);
        Box::pin(async move {
            incoming_data(payload)?;
            let result = action().await?;
            Ok(Some(MessagePayload::from_serialize(&result)?))
        })
    }
}

/// Runs `action` with the payload's data deserialized into `T`.
pub fn invoke_action_with_payload<F, Fut, T, R>(
    action: F,
) -> impl Fn(MessagePayload) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize,
{
    let action = Arc::new(action);
    move |payload: MessagePayload| -> BoxFuture<'static, HandlerResult> {
        let action = Arc::clone(&action);
        Box::pin(async move {
            let params: T = parse_params(incoming_data(payload)?)?;
            let result = action(params).await?;
            Ok(Some(MessagePayload::from_serialize(&result)?))
        })
    }
}

/// Like [`invoke_action_with_payload`], also passing the delivery's routing
/// key. For exchange subscriptions.
pub fn invoke_action_with_routing_key_and_payload<F, Fut, T, R>(
    action: F,
) -> impl Fn(String, MessagePayload) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static
where
    F: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize,
{
    let action = Arc::new(action);
    move |routing_key: String, payload: MessagePayload| -> BoxFuture<'static, HandlerResult> {
        let action = Arc::clone(&action);
        Box::pin(async move {
            let params: T = parse_params(incoming_data(payload)?)?;
            let result = action(routing_key, params).await?;
            Ok(Some(MessagePayload::from_serialize(&result)?))
        })
    }
}

fn incoming_data(payload: MessagePayload) -> anyhow::Result<Value> {
    payload.into_result().map_err(anyhow::Error::new)
}

fn parse_params<T: DeserializeOwned>(data: Value) -> anyhow::Result<T> {
    serde_json::from_value(data).map_err(|err| {
        RabbitMQError::InvalidPayload(format!("payload data does not match the action's parameters: {}", err))
            .into()
    })
}
