//! # In-Memory Broker
//!
//! A process-local broker implementing the transport ports with topic
//! exchange routing. Suitable for single-process runs and as the broker
//! double in tests.
//!
//! ## Test controls
//!
//! - Faults: refused connects, connect and close latency, connection error,
//!   clean connection close, channel error
//! - Publisher confirms: ack, nack with a reason, delayed ack, held forever
//! - Inspection: queues, bindings, consumers, connect counts
//!
//! Exclusive queues are removed with their connection. Auto-delete queues are
//! removed when their last consumer is cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_telemetry::HeaderCarrier;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    Confirmation, Delivery, OutboundMessage, TopicSelector, TransportError, DEFAULT_EXCHANGE,
};
use crate::ports::{
    BrokerChannel, BrokerConnection, BrokerTransport, ConfirmFuture, Consumer, EventSink,
    PendingConfirm, QueueOptions, TransportEvent,
};

/// How the broker answers publisher confirms.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    #[default]
    Ack,
    /// Reject every publish with this reason.
    Nack(String),
    /// Acknowledge after a delay.
    Delay(Duration),
    /// Never answer.
    Hold,
}

/// An exchange-to-queue binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

struct ConnectionRecord {
    events: EventSink,
}

struct ConsumerRecord {
    tag: String,
    channel: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    /// Owning connection of an exclusive queue.
    owner: Option<u64>,
    consumers: Vec<ConsumerRecord>,
    backlog: VecDeque<Delivery>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    /// Exchange name -> durable.
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingInfo>,
    connections: HashMap<u64, ConnectionRecord>,
    /// Open channel id -> connection id.
    channels: HashMap<u64, u64>,
    next_id: u64,

    failing_connects: u32,
    connect_delay: Duration,
    close_delay: Duration,
    confirm: ConfirmBehavior,

    connect_attempts: u64,
    connections_opened: u64,
    published: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> Result<(), TransportError> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
    }

    fn remove_consumers(&mut self, mut predicate: impl FnMut(&ConsumerRecord) -> bool) {
        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !predicate(c));
            if before > 0 && queue.consumers.is_empty() && queue.options.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.remove_queue(&name);
        }
    }

    fn close_channel(&mut self, channel: u64) -> Option<u64> {
        let connection = self.channels.remove(&channel)?;
        self.remove_consumers(|c| c.channel == channel);
        Some(connection)
    }

    fn drop_connection(&mut self, connection: u64) -> Option<ConnectionRecord> {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, conn)| **conn == connection)
            .map(|(ch, _)| *ch)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.remove_queue(&name);
        }
        self.connections.remove(&connection)
    }

    fn route(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let targets: Vec<String> = if message.exchange == DEFAULT_EXCHANGE {
            self.queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            if !self.exchanges.contains_key(&message.exchange) {
                return Err(TransportError::Broker(format!(
                    "NOT_FOUND - no exchange '{}'",
                    message.exchange
                )));
            }
            let mut targets: Vec<String> = Vec::new();
            for binding in &self.bindings {
                if binding.exchange == message.exchange
                    && TopicSelector::new(binding.routing_key.as_str()).matches(&message.routing_key)
                    && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Message unroutable, dropped"
            );
        }

        for queue in targets {
            let delivery_tag = self.next_id();
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                headers: message.headers.clone(),
                body: message.body.clone(),
            };
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.deliver(delivery);
            }
        }
        Ok(())
    }
}

impl QueueState {
    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            match self.consumers[index].sender.send(delivery) {
                Ok(()) => {
                    self.next_consumer = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // receiver dropped without a cancel
                    self.consumers.remove(index);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

/// In-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------------

    /// Refuse the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Delay every connect attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Delay every client-side connection close.
    pub fn set_close_delay(&self, delay: Duration) {
        self.state.lock().close_delay = delay;
    }

    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.state.lock().confirm = behavior;
    }

    /// Fail every open connection with `reason`.
    pub fn fail_connection(&self, reason: &str) {
        self.drop_connections(|| TransportEvent::ConnectionError(reason.to_string()));
    }

    /// Close every open connection from the broker side.
    pub fn close_connection(&self) {
        self.drop_connections(|| TransportEvent::ConnectionClosed);
    }

    /// Fail every open channel with `reason`. Connections stay open.
    pub fn fail_channel(&self, reason: &str) {
        let mut notify = Vec::new();
        {
            let mut state = self.state.lock();
            let channels: Vec<u64> = state.channels.keys().copied().collect();
            for channel in channels {
                if let Some(connection) = state.close_channel(channel) {
                    if let Some(record) = state.connections.get(&connection) {
                        notify.push(record.events.clone());
                    }
                }
            }
        }
        for events in notify {
            let _ = events.send(TransportEvent::ChannelError(reason.to_string()));
        }
    }

    fn drop_connections(&self, event: impl Fn() -> TransportEvent) {
        let records: Vec<ConnectionRecord> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.drop_connection(id))
                .collect()
        };
        for record in records {
            let _ = record.events.send(event());
        }
    }

    /// Publish raw bytes as another client would.
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: HeaderCarrier,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.state.lock().route(OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            headers,
            body: body.into(),
        })
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    /// Connect attempts, including refused and abandoned ones.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Connections successfully opened.
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Durability of a declared exchange, `None` if undeclared.
    pub fn exchange_durable(&self, name: &str) -> Option<bool> {
        self.state.lock().exchanges.get(name).copied()
    }

    /// Queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state.lock().queues.get(name).map(|q| q.options)
    }

    /// Messages waiting in a queue with no consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.backlog.len())
    }

    pub fn bindings(&self) -> Vec<BindingInfo> {
        self.state.lock().bindings.clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.state
            .lock()
            .queues
            .values()
            .map(|q| q.consumers.len())
            .sum()
    }

    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let id = state.next_id();
        state.connections.insert(id, ConnectionRecord { events });
        state.connections_opened += 1;
        debug!(connection = id, "In-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::ChannelClosed);
        }
        let id = state.next_id();
        state.channels.insert(id, self.id);
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            id,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let delay = self.broker.state.lock().close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.broker.state.lock().drop_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().connections.contains_key(&self.id)
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    connection: u64,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        state.exchanges.entry(name.to_string()).or_insert(durable);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let owner = options.exclusive.then_some(self.connection);
        state.queues.entry(name.clone()).or_insert_with(|| QueueState {
            options,
            owner,
            consumers: Vec::new(),
            backlog: VecDeque::new(),
            next_consumer: 0,
        });
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Broker(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Broker(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let binding = BindingInfo {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, TransportError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Broker(format!("NOT_FOUND - no queue '{queue}'")))?;

        let (sender, deliveries) = mpsc::unbounded_channel();
        while let Some(delivery) = target.backlog.pop_front() {
            let _ = sender.send(delivery);
        }
        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        target.consumers.push(ConsumerRecord {
            tag: tag.clone(),
            channel: self.id,
            sender,
        });
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
        self.broker.state.lock().channel_open(self.id)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        let channel = self.id;
        state.remove_consumers(|c| c.tag == consumer_tag && c.channel == channel);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        state.remove_queue(queue);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, TransportError> {
        let behavior = {
            let mut state = self.broker.state.lock();
            state.channel_open(self.id)?;
            state.route(message)?;
            state.published += 1;
            state.confirm.clone()
        };

        let confirmation: ConfirmFuture = match behavior {
            ConfirmBehavior::Ack => futures::future::ready(Ok(Confirmation::Ack)).boxed(),
            ConfirmBehavior::Nack(reason) => {
                futures::future::ready(Ok(Confirmation::Nack { reason })).boxed()
            }
            ConfirmBehavior::Delay(delay) => async move {
                tokio::time::sleep(delay).await;
                Ok(Confirmation::Ack)
            }
            .boxed(),
            ConfirmBehavior::Hold => futures::future::pending().boxed(),
        };

        Ok(PendingConfirm {
            accepted: true,
            confirmation,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().channels.contains_key(&self.id)
    }
}
