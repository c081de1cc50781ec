// src/rabbitmq/memory.rs
// In-process broker implementing the transport traits. It keeps enough of the
// AMQP model (exchanges, bindings, queues, prefetch, acks, direct reply-to) to
// exercise the client end to end without a server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, ConnectionSignal, Delivery, DeliveryStream, Established,
    ExchangeType, MessageProperties, QueueOptions, Transport, DEFAULT_REPLY_TO,
};

type DeliverySender = UnboundedSender<Result<Delivery>>;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    available: bool,
    next_id: u64,
    connections: HashMap<u64, ConnectionSlot>,
    channels: HashMap<u64, ChannelSlot>,
    exchanges: HashMap<String, ExchangeSlot>,
    queues: HashMap<String, QueueSlot>,
    bindings: Vec<Binding>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            next_id: 0,
            connections: HashMap::new(),
            channels: HashMap::new(),
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
        }
    }
}

struct ConnectionSlot {
    signals: mpsc::UnboundedSender<ConnectionSignal>,
    open: Arc<AtomicBool>,
}

struct ChannelSlot {
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
    reply_consumer: Option<DeliverySender>,
    open: Arc<AtomicBool>,
}

struct Unacked {
    queue: String,
    consumer_tag: u64,
    message: StoredMessage,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    data: Vec<u8>,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            data: self.data.clone(),
        }
    }
}

struct ExchangeSlot {
    kind: ExchangeType,
    durable: bool,
}

struct QueueSlot {
    durable: bool,
    exclusive_owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct ConsumerSlot {
    tag: u64,
    channel: u64,
    no_ack: bool,
    sender: DeliverySender,
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    /// While unavailable, connection attempts are refused.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Closes every connection from the broker side, as a server restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(slot) = state.connections.get(&id) {
                let _ = slot
                    .signals
                    .send(ConnectionSignal::Closed(Some("CONNECTION_FORCED".to_string())));
            }
            state.close_connection(id);
        }
    }

    pub fn block(&self, reason: &str) {
        self.signal_all(ConnectionSignal::Blocked(reason.to_string()));
    }

    pub fn unblock(&self) {
        self.signal_all(ConnectionSignal::Unblocked);
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// `None` when the queue does not exist.
    pub fn is_durable(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).map(|q| q.durable)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Messages waiting in a queue, not counting unacknowledged ones.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    fn signal_all(&self, signal: ConnectionSignal) {
        let state = self.lock();
        for slot in state.connections.values() {
            let _ = slot.signals.send(signal.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&self, channel_id: u64) -> Result<&ChannelSlot> {
        self.channels
            .get(&channel_id)
            .ok_or_else(|| RabbitMQError::ChannelError(format!("channel {} is closed", channel_id)))
    }

    fn close_connection(&mut self, connection_id: u64) {
        if let Some(slot) = self.connections.remove(&connection_id) {
            slot.open.store(false, Ordering::SeqCst);
        }

        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.exclusive_owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            debug!(queue = %name, "Deleting exclusive queue");
            self.queues.remove(&name);
            self.bindings.retain(|binding| binding.queue != name);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        channel.open.store(false, Ordering::SeqCst);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel != channel_id);
        }

        let mut unacked: Vec<(u64, Unacked)> = channel.unacked.into_iter().collect();
        unacked.sort_by(|a, b| b.0.cmp(&a.0));

        let mut touched = Vec::new();
        for (_, entry) in unacked {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                touched.push(entry.queue);
            }
        }
        touched.dedup();
        for name in touched {
            self.dispatch(&name);
        }
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.ready.push_back(message);
            self.dispatch(queue_name);
        }
    }

    /// Hands ready messages to consumers round-robin, honouring each
    /// consumer channel's prefetch limit.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|consumer| !consumer.sender.is_closed());

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let mut chosen = None;

            for offset in 0..count {
                let idx = (queue.cursor + offset) % count;
                let consumer = &queue.consumers[idx];
                if consumer.no_ack {
                    chosen = Some(idx);
                    break;
                }
                let Some(channel) = self.channels.get(&consumer.channel) else {
                    continue;
                };
                let in_flight = channel
                    .unacked
                    .values()
                    .filter(|entry| entry.consumer_tag == consumer.tag)
                    .count();
                if channel.prefetch == 0 || in_flight < channel.prefetch as usize {
                    chosen = Some(idx);
                    break;
                }
            }

            let Some(idx) = chosen else {
                break;
            };
            queue.cursor = (idx + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let consumer = &queue.consumers[idx];
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                queue.ready.push_front(message);
                break;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = message.to_delivery(tag);

            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }

            if !consumer.no_ack {
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: consumer.tag,
                        message,
                    },
                );
            }
        }
    }

    fn deliver_reply(&mut self, channel_id: u64, message: StoredMessage) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            debug!(channel = channel_id, "Dropping reply for closed channel");
            return;
        };
        let Some(sender) = &channel.reply_consumer else {
            return;
        };
        channel.next_tag += 1;
        let _ = sender.unbounded_send(Ok(message.to_delivery(channel.next_tag)));
    }

    fn publish(
        &mut self,
        channel_id: u64,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        mut properties: MessageProperties,
    ) -> Result<()> {
        let channel = self.open_channel(channel_id)?;

        if properties.reply_to.as_deref() == Some(DEFAULT_REPLY_TO) {
            if channel.reply_consumer.is_none() {
                return Err(RabbitMQError::ChannelError(
                    "PRECONDITION_FAILED - fast reply consumer does not exist".to_string(),
                ));
            }
            properties.reply_to = Some(format!("{}.{}", DEFAULT_REPLY_TO, channel_id));
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            data: body.to_vec(),
            redelivered: false,
        };

        if exchange.is_empty() {
            let reply_prefix = format!("{}.", DEFAULT_REPLY_TO);
            if let Some(target) = routing_key.strip_prefix(&reply_prefix) {
                if let Ok(target) = target.parse::<u64>() {
                    self.deliver_reply(target, message);
                }
                return Ok(());
            }
            // Unroutable messages are dropped.
            self.enqueue(routing_key, message);
            return Ok(());
        }

        let Some(slot) = self.exchanges.get(exchange) else {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        };
        let kind = slot.kind;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| {
                binding.exchange == exchange && route_matches(kind, &binding.routing_key, routing_key)
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    fn assert_queue(&mut self, channel_id: u64, name: &str, options: QueueOptions) -> Result<String> {
        let connection = self.open_channel(channel_id)?.connection;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        match self.queues.get(&name) {
            Some(existing) => {
                if existing.durable != options.durable {
                    return Err(RabbitMQError::ChannelError(format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                        name
                    )));
                }
                if existing.exclusive_owner.is_some_and(|owner| owner != connection) {
                    return Err(RabbitMQError::ChannelError(format!(
                        "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                        name
                    )));
                }
            }
            None => {
                self.queues.insert(
                    name.clone(),
                    QueueSlot {
                        durable: options.durable,
                        exclusive_owner: options.exclusive.then_some(connection),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
            }
        }
        Ok(name)
    }

    fn assert_exchange(&mut self, channel_id: u64, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        self.open_channel(channel_id)?;
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(RabbitMQError::ChannelError(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges
                    .insert(name.to_string(), ExchangeSlot { kind, durable });
                Ok(())
            }
        }
    }

    fn bind_queue(&mut self, channel_id: u64, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.open_channel(channel_id)?;
        if !self.queues.contains_key(queue) {
            return Err(RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let exists = self.bindings.iter().any(|binding| {
            binding.queue == queue && binding.exchange == exchange && binding.routing_key == routing_key
        });
        if !exists {
            self.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    fn consume(&mut self, channel_id: u64, queue_name: &str, no_ack: bool) -> Result<DeliveryStream> {
        let connection = self.open_channel(channel_id)?.connection;
        let (sender, receiver) = unbounded();

        if queue_name == DEFAULT_REPLY_TO {
            if !no_ack {
                return Err(RabbitMQError::ChannelError(
                    "PRECONDITION_FAILED - reply consumer cannot acknowledge".to_string(),
                ));
            }
            if let Some(channel) = self.channels.get_mut(&channel_id) {
                channel.reply_consumer = Some(sender);
            }
            return Ok(receiver.boxed());
        }

        let tag = self.next_id();
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                queue_name
            )));
        };
        if queue.exclusive_owner.is_some_and(|owner| owner != connection) {
            return Err(RabbitMQError::ChannelError(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                queue_name
            )));
        }

        queue.consumers.push(ConsumerSlot {
            tag,
            channel: channel_id,
            no_ack,
            sender,
        });
        self.dispatch(queue_name);
        Ok(receiver.boxed())
    }

    fn settle(&mut self, channel_id: u64, delivery_tag: u64, requeue: Option<bool>) -> Result<()> {
        let channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| RabbitMQError::AckError(format!("channel {} is closed", channel_id)))?;
        let Some(entry) = channel.unacked.remove(&delivery_tag) else {
            return Err(RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        };

        if requeue == Some(true) {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        self.dispatch(&entry.queue);
        Ok(())
    }
}

fn route_matches(kind: ExchangeType, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeType::Fanout => true,
        ExchangeType::Direct => binding_key == routing_key,
        ExchangeType::Topic => topic_matches(binding_key, routing_key),
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && match_words(rest, &words[1..]),
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Established> {
        let mut state = self.broker.lock();
        if !state.available {
            return Err(RabbitMQError::ConnectionError(format!(
                "Connection refused: {}",
                url
            )));
        }

        let id = state.next_id();
        let (signals, receiver) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            id,
            ConnectionSlot {
                signals,
                open: open.clone(),
            },
        );
        debug!(connection = id, "Memory broker accepted connection");

        Ok(Established {
            connection: Arc::new(MemoryConnection {
                broker: self.broker.clone(),
                id,
                open,
            }),
            signals: receiver,
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(RabbitMQError::ConnectionError(
                "invalid connection state: Closed".to_string(),
            ));
        }

        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelSlot {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
                reply_consumer: None,
                open: open.clone(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            open,
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionError(
                "invalid connection state: Closed".to_string(),
            ));
        }
        self.broker.lock().close_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.broker.lock().assert_queue(self.id, name, options)
    }

    async fn assert_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        self.broker.lock().assert_exchange(self.id, name, kind, durable)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.lock().bind_queue(self.id, queue, exchange, routing_key)
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| RabbitMQError::ChannelError(format!("channel {} is closed", self.id)))?;
        channel.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream> {
        self.broker.lock().consume(self.id, queue, no_ack)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        self.broker
            .lock()
            .publish(self.id, exchange, routing_key, body, properties)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.broker.lock().settle(self.id, delivery_tag, None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.broker.lock().settle(self.id, delivery_tag, Some(requeue))
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
