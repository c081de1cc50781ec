// src/rabbitmq/connection.rs
// Connection manager: owns the single broker connection, republishes its
// signals as events and reconnects after the heartbeat interval.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::{ChannelRegistry, ManagedChannel};
use super::errors::{RabbitMQError, Result};
use super::transport::{BrokerConnection, ConnectionSignal, Established, Transport};
use crate::config::BrokerConfig;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Disconnect,
    Blocked { reason: String },
    Unblocked,
    Error { message: String },
}

#[derive(Default)]
struct Link {
    connection: Option<Arc<dyn BrokerConnection>>,
    // bumped on every install and teardown so stale watchers stand down
    generation: u64,
    watcher: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    last_error: Option<String>,
    shut_down: bool,
    // set while a teardown has taken the connection but not yet raised Disconnect
    closing: bool,
}

pub struct ConnectionManager {
    id: String,
    url: String,
    heartbeat: Duration,
    transport: Arc<dyn Transport>,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    channels: Arc<ChannelRegistry>,
}

impl ConnectionManager {
    pub fn new(config: &BrokerConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            url: config.url.clone(),
            heartbeat: config.heartbeat(),
            transport,
            link: Mutex::new(Link::default()),
            state,
            events,
            channels: ChannelRegistry::new(),
        });

        debug!(
            connection_id = %manager.id,
            url = %manager.url,
            heartbeat = ?manager.heartbeat,
            "Creating connection manager"
        );
        manager
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Events raised from now on: connect, disconnect, blocked, unblocked, error.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connects unless already connected. Concurrent callers share the one
    /// in-flight attempt. With a non-zero heartbeat, failed attempts are
    /// retried until one succeeds; with a zero heartbeat the first failure
    /// is returned.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.subscribe();

        let mut start = false;
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected {
                *current = ConnectionState::Connecting;
                start = true;
                true
            } else {
                false
            }
        });

        if start {
            self.lock().shut_down = false;
            self.spawn_connector(None);
        }

        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    let reason = self
                        .lock()
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "connection attempt abandoned".to_string());
                    return Err(RabbitMQError::ConnectionError(reason));
                }
                ConnectionState::Connecting => {}
            }

            if state.changed().await.is_err() {
                return Err(RabbitMQError::ConnectionError(
                    "connection manager dropped".to_string(),
                ));
            }
        }
    }

    /// Closes the current connection and returns once the disconnect event has
    /// been raised. Auto-reconnect still applies afterwards.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        let mut events = self.events.subscribe();

        if !self.teardown(None, true).await {
            if !self.lock().closing {
                self.cancel_connector();
                return Ok(());
            }
            debug!(connection_id = %self.id, "Teardown already in progress, waiting for it");
        }

        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Disconnect) => return Ok(()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Closes every channel and the connection for good. No reconnect is
    /// scheduled until `connect()` is called again.
    pub async fn shutdown(self: &Arc<Self>) {
        self.lock().shut_down = true;
        self.cancel_connector();

        let closed = self.channels.close_all().await;
        debug!(connection_id = %self.id, channels = closed, "Closed channels for shutdown");

        self.teardown(None, true).await;
    }

    /// Opens a channel on the current connection, waiting for the next
    /// connection if there is none.
    pub async fn create_channel(&self) -> Result<Arc<ManagedChannel>> {
        let connection = self.current_connection().await?;
        let channel = connection.create_channel().await?;
        let managed = self.channels.register(channel);

        debug!(connection_id = %self.id, channel_id = %managed.id(), "Created channel");
        Ok(managed)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.ids()
    }

    pub async fn close_all_channels(&self) -> usize {
        self.channels.close_all().await
    }

    async fn current_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state.subscribe();
        loop {
            if let Some(connection) = self.lock().connection.clone() {
                return Ok(connection);
            }

            debug!(connection_id = %self.id, "Waiting for a connection before opening a channel");
            if state.changed().await.is_err() {
                return Err(RabbitMQError::ConnectionError(
                    "connection manager dropped".to_string(),
                ));
            }
        }
    }

    fn spawn_connector(self: &Arc<Self>, delay: Option<Duration>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Some(delay) = delay {
                sleep(delay).await;

                let mut start = false;
                manager.state.send_if_modified(|current| {
                    if *current == ConnectionState::Disconnected {
                        *current = ConnectionState::Connecting;
                        start = true;
                        true
                    } else {
                        false
                    }
                });
                if !start {
                    return;
                }
            }
            manager.run_connector().await;
        });

        if let Some(previous) = self.lock().connector.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_connector(&self) {
        let connector = self.lock().connector.take();
        if let Some(connector) = connector {
            connector.abort();
        }
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Connecting {
                *current = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    async fn run_connector(self: Arc<Self>) {
        loop {
            info!(connection_id = %self.id, "Connecting to {}", self.url);

            match self.transport.connect(&self.url).await {
                Ok(established) => {
                    self.install(established);
                    return;
                }
                Err(err) => {
                    self.lock().last_error = Some(err.to_string());

                    if self.heartbeat.is_zero() {
                        error!(
                            connection_id = %self.id,
                            error = %err,
                            "Unable to connect to {} and auto-reconnect is disabled",
                            self.url
                        );
                        self.state.send_replace(ConnectionState::Disconnected);
                        return;
                    }

                    warn!(
                        connection_id = %self.id,
                        error = %err,
                        "Unable to connect to {}, retrying in {:?}",
                        self.url,
                        self.heartbeat
                    );
                    sleep(self.heartbeat).await;
                }
            }
        }
    }

    fn install(self: &Arc<Self>, established: Established) {
        let Established {
            connection,
            signals,
        } = established;

        {
            let mut link = self.lock();
            link.generation += 1;
            let generation = link.generation;

            link.connection = Some(connection);
            link.connector = None;
            link.last_error = None;
            link.watcher = Some(tokio::spawn(Arc::clone(self).watch(signals, generation)));
            self.state.send_replace(ConnectionState::Connected);
        }

        info!(connection_id = %self.id, url = %self.url, "Connected to RabbitMQ");
        let _ = self.events.send(ConnectionEvent::Connect);
    }

    async fn watch(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
        generation: u64,
    ) {
        let reason = loop {
            match signals.recv().await {
                Some(ConnectionSignal::Blocked(reason)) => {
                    warn!(connection_id = %self.id, reason = %reason, "Connection blocked");
                    let _ = self.events.send(ConnectionEvent::Blocked { reason });
                }
                Some(ConnectionSignal::Unblocked) => {
                    info!(connection_id = %self.id, "Connection unblocked");
                    let _ = self.events.send(ConnectionEvent::Unblocked);
                }
                Some(ConnectionSignal::Error(message)) => {
                    error!(connection_id = %self.id, error = %message, "Connection error");
                    let _ = self.events.send(ConnectionEvent::Error {
                        message: message.clone(),
                    });
                    break message;
                }
                Some(ConnectionSignal::Closed(reason)) => {
                    break reason.unwrap_or_else(|| "closed by broker".to_string());
                }
                None => break "connection signals ended".to_string(),
            }
        };

        warn!(connection_id = %self.id, reason = %reason, "Connection lost");
        self.teardown(Some(generation), false).await;
    }

    /// Clears the connection, raises `Disconnect` and schedules a reconnect.
    /// Returns false when there was nothing to tear down (or `generation` is
    /// stale).
    async fn teardown(self: &Arc<Self>, generation: Option<u64>, abort_watcher: bool) -> bool {
        let (connection, watcher, shut_down) = {
            let mut link = self.lock();
            if generation.is_some_and(|g| g != link.generation) {
                return false;
            }
            let Some(connection) = link.connection.take() else {
                return false;
            };
            link.generation += 1;
            link.closing = true;
            self.state.send_replace(ConnectionState::Disconnected);
            (connection, link.watcher.take(), link.shut_down)
        };

        if abort_watcher {
            if let Some(watcher) = watcher {
                watcher.abort();
            }
        }

        self.channels.clear();

        if connection.is_open() {
            if let Err(err) = connection.close().await {
                warn!(connection_id = %self.id, error = %err, "Failed to close connection");
            }
        }

        info!(connection_id = %self.id, "Disconnected from RabbitMQ");
        let _ = self.events.send(ConnectionEvent::Disconnect);
        self.lock().closing = false;

        if shut_down {
            debug!(connection_id = %self.id, "Shut down, not reconnecting");
        } else if self.heartbeat.is_zero() {
            debug!(connection_id = %self.id, "Auto-reconnect disabled");
        } else {
            info!(connection_id = %self.id, "Reconnecting in {:?}", self.heartbeat);
            self.spawn_connector(Some(self.heartbeat));
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
