// src/rabbitmq/amqp_client.rs
// The context object applications build once at startup and pass around.
// Publish and consume operations live in publisher.rs and consumer.rs.

use std::sync::Arc;

use tracing::warn;

use super::channel_manager::ManagedChannel;
use super::connection::{ConnectionManager, ConnectionState};
use super::correlation::CorrelationRegistry;
use super::errors::Result;
use super::lapin_transport::LapinTransport;
use super::transport::Transport;
use crate::config::BrokerConfig;

#[derive(Clone)]
pub struct AmqpClient {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) correlations: Arc<CorrelationRegistry>,
}

impl AmqpClient {
    /// Builds a client without connecting.
    pub fn new(config: &BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            manager: ConnectionManager::new(config, transport),
            correlations: CorrelationRegistry::new(),
        }
    }

    /// Builds a client over lapin without connecting.
    pub fn with_lapin(config: &BrokerConfig) -> Self {
        let transport = LapinTransport::new().with_connection_name("rust-rabbit-rpc");
        Self::new(config, Arc::new(transport))
    }

    /// Builds a client and starts connecting in the background. Operations
    /// issued before the connection is up wait for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_from_config(config: &BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let client = Self::new(config, transport);

        let manager = Arc::clone(&client.manager);
        tokio::spawn(async move {
            if let Err(err) = manager.connect().await {
                warn!(connection_id = %manager.id(), error = %err, "Initial connect failed");
            }
        });

        client
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Number of requests currently waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.correlations.len()
    }

    pub async fn create_channel(&self) -> Result<Arc<ManagedChannel>> {
        self.manager.create_channel().await
    }
}
