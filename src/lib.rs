//! Message-broker layer over RabbitMQ: a reconnecting connection manager,
//! tracked channels, JSON-envelope publish/consume and correlation-id RPC.

pub mod config;
pub mod message;
pub mod rabbitmq;

pub use config::BrokerConfig;
pub use message::{MessagePayload, SerializedError, JSON_CONTENT_TYPE};
pub use rabbitmq::{
    AmqpClient, ExchangeType, MemoryBroker, RabbitMQError, ReceiveOptions, ReplyTo, Result,
    RpcClient, RpcServer, SendOptions, SendOutcome, Subscription,
};
