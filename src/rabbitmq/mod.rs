// src/rabbitmq/mod.rs
// RabbitMQ layer: connection management, channels, publish/consume and RPC

pub mod errors;
pub mod transport;

pub mod lapin_transport;
pub mod memory;

pub mod channel_manager;
pub mod connection;
pub mod correlation;

mod action;
mod amqp_client;
mod consumer;
mod publisher;
mod request_response;

// Re-export specific items to simplify imports elsewhere
pub use action::{invoke_action, invoke_action_with_payload, invoke_action_with_routing_key_and_payload};
pub use amqp_client::AmqpClient;
pub use channel_manager::ManagedChannel;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use consumer::{HandlerResult, ReceiveOptions, Subscription};
pub use errors::{RabbitMQError, Result};
pub use memory::MemoryBroker;
pub use publisher::{ReplyTo, SendOptions, SendOutcome};
pub use request_response::{RpcClient, RpcServer};
pub use transport::{ExchangeType, DEFAULT_REPLY_TO};
