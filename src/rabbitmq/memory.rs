// src/rabbitmq/memory.rs
// In-process broker used by the unit tests. Mimics the parts of RabbitMQ the
// client relies on: idempotent declares, manual acks, requeue on nack and on
// channel loss, close/blocked notifications.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::broker::{Broker, BrokerChannel, BrokerConnection};
use super::channel_manager::ChannelConfig;
use super::errors::{RabbitMQError, Result};
use super::types::{
    Acknowledger, ConsumerEvent, Delivery, Envelope, EventSender, QueueDescriptor, Role,
    Subscription,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerReg {
    tag: String,
    channel: usize,
    events: EventSender,
}

#[derive(Default)]
struct Queue {
    descriptor: Option<QueueDescriptor>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (usize, StoredMessage)>,
    consumers: Vec<ConsumerReg>,
}

struct ConnState {
    role: Role,
    open: bool,
    watchers: Vec<EventSender>,
}

struct ChanState {
    connection: usize,
    open: bool,
    watchers: Vec<EventSender>,
}

struct State {
    available: bool,
    fail_dials: u32,
    fail_channel_opens: u32,
    fail_declares: u32,
    fail_publishes: u32,
    nack_publishes: u32,
    dial_count: u32,
    last_uri: Option<String>,
    connections: Vec<ConnState>,
    channels: Vec<ChanState>,
    channel_configs: Vec<ChannelConfig>,
    queues: HashMap<String, Queue>,
    declare_count: u32,
    next_tag: u64,
    published: Vec<(String, Envelope)>,
    acked: Vec<Vec<u8>>,
    requeued: Vec<Vec<u8>>,
    rejected: Vec<Vec<u8>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            available: true,
            fail_dials: 0,
            fail_channel_opens: 0,
            fail_declares: 0,
            fail_publishes: 0,
            nack_publishes: 0,
            dial_count: 0,
            last_uri: None,
            connections: Vec::new(),
            channels: Vec::new(),
            channel_configs: Vec::new(),
            queues: HashMap::new(),
            declare_count: 0,
            next_tag: 0,
            published: Vec::new(),
            acked: Vec::new(),
            requeued: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl State {
    fn channel_open(&self, id: usize) -> bool {
        let chan = &self.channels[id];
        chan.open && self.connections[chan.connection].open
    }

    /// Push ready messages to the first live consumer of `queue`.
    fn dispatch(&mut self, broker: &MemoryBroker, queue_name: &str) {
        let live: Vec<bool> = (0..self.channels.len()).map(|id| self.channel_open(id)).collect();
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue
            .consumers
            .retain(|c| live[c.channel] && !c.events.is_closed());

        while !queue.ready.is_empty() {
            let Some(consumer) = queue.consumers.first() else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            self.next_tag += 1;
            let tag = self.next_tag;
            let acker = MemoryAcker {
                broker: broker.clone(),
                queue: queue_name.to_string(),
                tag,
            };
            let delivery = Delivery::new(message.body.clone(), message.redelivered, Box::new(acker));
            if consumer.events.send(ConsumerEvent::Delivery(delivery)).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(0);
                continue;
            }
            queue.unacked.insert(tag, (consumer.channel, message));
        }
    }

    /// Close a channel, requeueing whatever it still holds unacked.
    fn close_channel(&mut self, id: usize, notify: Option<&str>) -> Vec<String> {
        if !self.channels[id].open {
            return Vec::new();
        }
        self.channels[id].open = false;
        if let Some(reason) = notify {
            for watcher in &self.channels[id].watchers {
                let _ = watcher.send(ConsumerEvent::ChannelClosed(reason.to_string()));
            }
        }

        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            // A consumer's delivery stream ends with its channel.
            queue.consumers.retain(|c| {
                if c.channel == id {
                    let reason = format!("consumer {} stream ended", c.tag);
                    let _ = c.events.send(ConsumerEvent::ChannelClosed(reason));
                }
                c.channel != id
            });
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (channel, _))| *channel == id)
                .map(|(tag, _)| *tag)
                .collect();
            if tags.is_empty() {
                continue;
            }
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            touched.push(name.clone());
        }
        touched
    }

    fn close_connection(&mut self, id: usize, notify: Option<&str>) -> Vec<String> {
        if !self.connections[id].open {
            return Vec::new();
        }
        if let Some(reason) = notify {
            for watcher in &self.connections[id].watchers {
                let _ = watcher.send(ConsumerEvent::ConnectionClosed(reason.to_string()));
            }
        }
        let channel_ids: Vec<usize> = (0..self.channels.len())
            .filter(|ch| self.channels[*ch].connection == id)
            .collect();
        let mut touched = Vec::new();
        for ch in channel_ids {
            touched.extend(self.close_channel(ch, notify));
        }
        self.connections[id].open = false;
        touched
    }
}

/// Shared handle to the in-memory broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn redispatch(&self, state: &mut State, queues: Vec<String>) {
        for name in queues {
            state.dispatch(self, &name);
        }
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn fail_next_dials(&self, count: u32) {
        self.lock().fail_dials = count;
    }

    pub fn fail_next_channel_opens(&self, count: u32) {
        self.lock().fail_channel_opens = count;
    }

    pub fn fail_next_declares(&self, count: u32) {
        self.lock().fail_declares = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().fail_publishes = count;
    }

    pub fn nack_next_publishes(&self, count: u32) {
        self.lock().nack_publishes = count;
    }

    /// Simulate the broker dropping every open connection.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let mut touched = Vec::new();
        for id in 0..state.connections.len() {
            touched.extend(state.close_connection(id, Some("CONNECTION_FORCED - broker forced connection closure")));
        }
        self.redispatch(&mut state, touched);
    }

    /// Simulate a broker-side channel error on every open channel.
    pub fn drop_channels(&self) {
        let mut state = self.lock();
        let mut touched = Vec::new();
        for id in 0..state.channels.len() {
            touched.extend(state.close_channel(id, Some("channel error")));
        }
        self.redispatch(&mut state, touched);
    }

    /// Simulate a resource alarm (memory or disk) blocking publishers.
    pub fn block_connections(&self) {
        let state = self.lock();
        for conn in state.connections.iter().filter(|c| c.open) {
            for watcher in &conn.watchers {
                let _ = watcher.send(ConsumerEvent::ConnectionBlocked("low on memory".to_string()));
            }
        }
    }

    /// Enqueue a message as if a third party had published it.
    pub fn inject(&self, queue: &str, body: &[u8]) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                body: body.to_vec(),
                redelivered: false,
            });
        state.dispatch(self, queue);
    }

    pub fn dial_count(&self) -> u32 {
        self.lock().dial_count
    }

    pub fn last_uri(&self) -> Option<String> {
        self.lock().last_uri.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.iter().filter(|c| c.open).count()
    }

    pub fn open_connections_for(&self, role: Role) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.open && c.role == role)
            .count()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        self.lock().channel_configs.clone()
    }

    pub fn declare_count(&self) -> u32 {
        self.lock().declare_count
    }

    pub fn queue_descriptor(&self, queue: &str) -> Option<QueueDescriptor> {
        self.lock().queues.get(queue).and_then(|q| q.descriptor.clone())
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Bodies waiting in `queue` (not delivered, or requeued).
    pub fn ready(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    pub fn requeued(&self) -> Vec<Vec<u8>> {
        self.lock().requeued.clone()
    }

    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.lock().rejected.clone()
    }

    fn settle(&self, queue: &str, tag: u64, outcome: Settle) -> Result<()> {
        let mut state = self.lock();
        let channel = state
            .queues
            .get(queue)
            .and_then(|q| q.unacked.get(&tag))
            .map(|(channel, _)| *channel);
        let Some(channel) = channel else {
            return Err(RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                tag
            )));
        };
        if !state.channel_open(channel) {
            return Err(RabbitMQError::AckError("channel is closed".to_string()));
        }
        let Some((_, mut message)) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag))
        else {
            return Err(RabbitMQError::AckError(format!("unknown delivery tag {}", tag)));
        };
        match outcome {
            Settle::Ack => state.acked.push(message.body),
            Settle::Reject => state.rejected.push(message.body),
            Settle::Requeue => {
                state.requeued.push(message.body.clone());
                message.redelivered = true;
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_front(message);
                }
                state.dispatch(self, queue);
            }
        }
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.queue, self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Reject };
        self.broker.settle(&self.queue, self.tag, outcome)
    }

    async fn reject(&self) -> Result<()> {
        self.broker.settle(&self.queue, self.tag, Settle::Reject)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn dial(&self, uri: &str, role: Role) -> Result<MemoryConnection> {
        let mut state = self.lock();
        state.dial_count += 1;
        state.last_uri = Some(uri.to_string());
        if !state.available {
            return Err(RabbitMQError::connection(role, "Connection refused (os error 111)"));
        }
        if state.fail_dials > 0 {
            state.fail_dials -= 1;
            return Err(RabbitMQError::connection(role, "Connection reset by peer"));
        }
        state.connections.push(ConnState {
            role,
            open: true,
            watchers: Vec::new(),
        });
        Ok(MemoryConnection {
            broker: self.clone(),
            id: state.connections.len() - 1,
            role,
        })
    }
}

#[derive(Clone)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: usize,
    role: Role,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self, config: &ChannelConfig) -> Result<MemoryChannel> {
        let mut state = self.broker.lock();
        if !state.connections[self.id].open {
            return Err(RabbitMQError::channel(self.role, "connection is closed"));
        }
        if state.fail_channel_opens > 0 {
            state.fail_channel_opens -= 1;
            return Err(RabbitMQError::channel(self.role, "channel open timed out"));
        }
        state.channels.push(ChanState {
            connection: self.id,
            open: true,
            watchers: Vec::new(),
        });
        state.channel_configs.push(config.clone());
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id: state.channels.len() - 1,
            role: self.role,
        })
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connections[self.id].open
    }

    fn watch(&self, events: EventSender) {
        self.broker.lock().connections[self.id].watchers.push(events);
    }

    async fn close(&self) {
        let broker = self.broker.clone();
        let mut state = broker.lock();
        let touched = state.close_connection(self.id, None);
        broker.redispatch(&mut state, touched);
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: usize,
    role: Role,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if state.channel_open(self.id) {
            Ok(())
        } else {
            Err(RabbitMQError::channel(self.role, "channel is closed"))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)
            .map_err(|e| RabbitMQError::declare(&queue.name, e))?;
        if state.fail_declares > 0 {
            state.fail_declares -= 1;
            let touched = state.close_channel(self.id, Some("declare failed"));
            self.broker.redispatch(&mut state, touched);
            return Err(RabbitMQError::declare(&queue.name, "channel closed during declare"));
        }
        state.declare_count += 1;
        let existing = state
            .queues
            .get(&queue.name)
            .and_then(|q| q.descriptor.clone());
        match existing {
            Some(existing) if existing != *queue => {
                let touched = state.close_channel(self.id, Some("PRECONDITION_FAILED"));
                self.broker.redispatch(&mut state, touched);
                Err(RabbitMQError::declare(
                    &queue.name,
                    "PRECONDITION_FAILED - inequivalent arg 'x-queue-mode'",
                ))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.entry(queue.name.clone()).or_default().descriptor = Some(queue.clone());
                Ok(())
            }
        }
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()> {
        // Confirms arrive asynchronously; let other publishers in meanwhile.
        tokio::task::yield_now().await;
        let mut state = self.broker.lock();
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(RabbitMQError::PublishError("connection reset".to_string()));
        }
        self.ensure_open(&state)
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        if state.nack_publishes > 0 {
            state.nack_publishes -= 1;
            return Err(RabbitMQError::PublishNacked(envelope.message_id.clone()));
        }
        state.published.push((routing_key.to_string(), envelope.clone()));
        // The default exchange drops messages for unknown queues.
        let routed = match state.queues.get_mut(routing_key) {
            Some(queue) => {
                queue.ready.push_back(StoredMessage {
                    body: envelope.body.clone(),
                    redelivered: false,
                });
                true
            }
            None => false,
        };
        if routed {
            state.dispatch(&self.broker, routing_key);
        }
        Ok(())
    }

    async fn consume(&self, subscription: &Subscription, events: EventSender) -> Result<()> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;
        let Some(queue) = state.queues.get_mut(&subscription.queue) else {
            return Err(RabbitMQError::ConsumeError(format!(
                "NOT_FOUND - no queue '{}'",
                subscription.queue
            )));
        };
        queue.consumers.push(ConsumerReg {
            tag: subscription.consumer_tag.clone(),
            channel: self.id,
            events,
        });
        state.dispatch(&self.broker, &subscription.queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channel_open(self.id)
    }

    fn watch(&self, events: EventSender) {
        self.broker.lock().channels[self.id].watchers.push(events);
    }

    async fn close(&self) {
        let broker = self.broker.clone();
        let mut state = broker.lock();
        let touched = state.close_channel(self.id, None);
        broker.redispatch(&mut state, touched);
    }
}
