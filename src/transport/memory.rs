//! In-process broker with the topic-exchange semantics the bus depends on.
//!
//! It keeps exchanges, durable queues, bindings, unacknowledged deliveries and
//! prefetch accounting behind one mutex, the same way the broker engine keeps
//! its topics and clients in one place. Deliveries still unacknowledged when a
//! channel or connection closes go back to the head of their queue marked as
//! redelivered. Rejected or expired messages follow the queue's dead-letter
//! arguments.
//!
//! A handful of inspection and fault-injection helpers (`sever_connections`,
//! `set_reachable`, `restart`, `queue_depth`, ...) let tests observe broker
//! state and simulate outages.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::{
    Acknowledger, Channel, Connection, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER, Delivery,
    DeliveryStream, HeaderValue, Headers, LinkState, OutgoingMessage, Transport, TransportError,
};
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, RoutingPattern};

type Shared = Arc<Mutex<BrokerState>>;

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    headers: Headers,
    message_id: Option<String>,
    persistent: bool,
    redelivered: bool,
    enqueued_at: Instant,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    message: StoredMessage,
    consumer_tag: String,
    connection: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    unacked: BTreeMap<u64, Unacked>,
    next_consumer: usize,
    dead_lettered: usize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            unacked: BTreeMap::new(),
            next_consumer: 0,
            dead_lettered: 0,
        }
    }

    /// Round-robin over consumers that still have prefetch room.
    fn next_available_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.next_consumer + offset) % count;
            if self.consumers[index].has_capacity() {
                self.next_consumer = index + 1;
                return Some(index);
            }
        }
        None
    }

    fn requeue_front(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.ready.push_front(message);
    }
}

enum Settlement {
    Ack,
    Reject { requeue: bool },
}

struct BrokerState {
    me: Weak<Mutex<BrokerState>>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    connections: HashMap<u64, watch::Sender<LinkState>>,
    reachable: bool,
    next_connection_id: u64,
    next_delivery_tag: u64,
    published: usize,
}

impl BrokerState {
    fn new(me: Weak<Mutex<BrokerState>>) -> Self {
        Self {
            me,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            reachable: true,
            next_connection_id: 0,
            next_delivery_tag: 0,
            published: 0,
        }
    }

    fn ensure_open(&self, connection: u64) -> Result<(), TransportError> {
        if self.connections.contains_key(&connection) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed(format!(
                "connection {connection} is closed"
            )))
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return match self.queues.contains_key(routing_key) {
                true => vec![routing_key.to_string()],
                false => Vec::new(),
            };
        }

        let Some(spec) = self.exchanges.get(exchange) else {
            return Vec::new();
        };

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match spec.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => RoutingPattern::parse(&binding.routing_key)
                    .map(|pattern| pattern.matches(routing_key))
                    .unwrap_or(false),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn enqueue(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> usize {
        let targets = self.route(exchange, routing_key);
        if targets.is_empty() {
            debug!(exchange, routing_key, "unroutable message dropped");
        }
        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(message.clone());
            }
        }
        for target in &targets {
            self.dispatch(target);
        }
        targets.len()
    }

    fn dispatch(&mut self, queue_name: &str) {
        self.expire(queue_name);

        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(index) = queue.next_available_consumer() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let slot = &queue.consumers[index];
            let acker = MemoryAcker {
                state: self.me.clone(),
                queue: queue_name.to_string(),
                delivery_tag: tag,
                connection: slot.connection,
            };
            let delivery = Delivery::new(
                tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.body.clone(),
                message.headers.clone(),
                message.message_id.clone(),
                message.redelivered,
                message.persistent,
                Box::new(acker),
            );

            if slot.sender.send(Ok(delivery)).is_err() {
                trace!(queue = queue_name, consumer = %slot.tag, "consumer went away");
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            let slot = &mut queue.consumers[index];
            slot.in_flight += 1;
            let consumer_tag = slot.tag.clone();
            let connection = slot.connection;
            queue.unacked.insert(
                tag,
                Unacked {
                    message,
                    consumer_tag,
                    connection,
                },
            );
        }
    }

    fn expire(&mut self, queue_name: &str) {
        let mut expired = Vec::new();
        if let Some(queue) = self.queues.get_mut(queue_name) {
            if let Some(ttl) = queue.spec.arguments.message_ttl_ms.map(Duration::from_millis) {
                while queue
                    .ready
                    .front()
                    .is_some_and(|message| message.enqueued_at.elapsed() >= ttl)
                {
                    if let Some(message) = queue.ready.pop_front() {
                        expired.push(message);
                    }
                }
            }
        }
        for message in expired {
            self.dead_letter(queue_name, message, "expired");
        }
    }

    fn dead_letter(&mut self, queue_name: &str, mut message: StoredMessage, reason: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.dead_lettered += 1;

        let Some(exchange) = queue.spec.arguments.dead_letter_exchange.clone() else {
            debug!(queue = queue_name, reason, "message discarded, no dead-letter exchange");
            return;
        };
        let routing_key = queue
            .spec
            .arguments
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());

        message
            .headers
            .insert(DEATH_QUEUE_HEADER.to_string(), HeaderValue::Text(queue_name.to_string()));
        message
            .headers
            .insert(DEATH_REASON_HEADER.to_string(), HeaderValue::Text(reason.to_string()));
        message.redelivered = false;
        message.enqueued_at = Instant::now();

        debug!(queue = queue_name, reason, exchange = %exchange, "message dead-lettered");
        self.enqueue(&exchange, &routing_key, message);
    }

    fn settle(
        &mut self,
        queue_name: &str,
        delivery_tag: u64,
        connection: u64,
        settlement: Settlement,
    ) -> Result<(), TransportError> {
        self.ensure_open(connection)?;

        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| TransportError::NotFound(format!("queue '{queue_name}'")))?;
        let entry = queue.unacked.remove(&delivery_tag).ok_or_else(|| {
            TransportError::Protocol(format!("unknown delivery tag {delivery_tag}"))
        })?;

        if let Some(slot) = queue
            .consumers
            .iter_mut()
            .find(|slot| slot.tag == entry.consumer_tag && slot.connection == entry.connection)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack => {}
            Settlement::Reject { requeue: true } => queue.requeue_front(entry.message),
            Settlement::Reject { requeue: false } => {
                self.dead_letter(queue_name, entry.message, "rejected")
            }
        }

        self.dispatch(queue_name);
        Ok(())
    }

    /// Cancel the consumers of `connection` and put its unacknowledged
    /// deliveries back at the head of their queues, oldest first.
    fn release(&mut self, connection: u64) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.consumers.retain(|slot| slot.connection != connection);

                let orphaned: Vec<u64> = queue
                    .unacked
                    .iter()
                    .filter(|(_, entry)| entry.connection == connection)
                    .map(|(tag, _)| *tag)
                    .collect();
                for tag in orphaned.into_iter().rev() {
                    if let Some(entry) = queue.unacked.remove(&tag) {
                        queue.requeue_front(entry.message);
                    }
                }
            }
            self.dispatch(&name);
        }
    }

    fn drop_connection(&mut self, connection: u64, reason: &str) {
        if let Some(state) = self.connections.remove(&connection) {
            state.send_replace(LinkState::Closed(reason.to_string()));
        }
        self.release(connection);
    }
}

/// Cheap to clone; clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Shared,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared);
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new_cyclic(|me| Mutex::new(BrokerState::new(me.clone()))),
        }
    }

    /// Drop every open connection, as a network partition would.
    pub fn sever_connections(&self) {
        let mut state = lock(&self.shared);
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(id, "connection reset by peer");
        }
    }

    /// Cancel every consumer of `queue` from the broker side, leaving the
    /// channels open, as happens when a queue is deleted under a consumer.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(target) = lock(&self.shared).queues.get_mut(queue) {
            target.consumers.clear();
        }
    }

    /// While unreachable, every connection attempt is refused.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.shared).reachable = reachable;
    }

    /// Simulate a broker restart: connections drop, transient entities and
    /// non-persistent messages are lost.
    pub fn restart(&self) {
        let mut guard = lock(&self.shared);
        let state = &mut *guard;

        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(id, "broker restart");
        }

        state.exchanges.retain(|_, exchange| exchange.durable);
        state.queues.retain(|_, queue| queue.spec.durable);
        state.bindings.retain(|binding| {
            state.exchanges.contains_key(&binding.exchange) && state.queues.contains_key(&binding.queue)
        });
        for queue in state.queues.values_mut() {
            queue.ready.retain(|message| message.persistent);
        }
    }

    pub fn exchange_count(&self) -> usize {
        lock(&self.shared).exchanges.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.shared).exchanges.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared).queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.shared).bindings.len()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared).connections.len()
    }

    pub fn published_count(&self) -> usize {
        lock(&self.shared).published
    }

    /// Ready messages waiting in `queue`, `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let mut state = lock(&self.shared);
        state.expire(queue);
        state.queues.get(queue).map(|q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// How many messages `queue` has dead-lettered or discarded so far.
    pub fn dead_lettered_count(&self, queue: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |q| q.dead_lettered)
    }

    /// Bodies of the ready messages in `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = lock(&self.shared);
        state.expire(queue);
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|message| message.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Headers of the ready messages in `queue`, head first.
    pub fn peek_headers(&self, queue: &str) -> Vec<Headers> {
        lock(&self.shared)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|message| message.headers.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut state = lock(&self.shared);
        if !state.reachable {
            return Err(TransportError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (sender, receiver) = watch::channel(LinkState::Open);
        state.connections.insert(id, sender);
        debug!(connection = id, "in-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
            state: receiver,
        }))
    }
}

struct MemoryConnection {
    shared: Shared,
    id: u64,
    state: watch::Receiver<LinkState>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        lock(&self.shared).ensure_open(self.id)?;
        let (status, _) = watch::channel(LinkState::Open);
        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            connection: self.id,
            open: AtomicBool::new(true),
            status,
        }))
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.shared).drop_connection(self.id, "closed by client");
        Ok(())
    }
}

struct MemoryChannel {
    shared: Shared,
    connection: u64,
    open: AtomicBool,
    status: watch::Sender<LinkState>,
}

impl MemoryChannel {
    fn broker(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed("channel closed by client".to_string()));
        }
        let state = lock(&self.shared);
        state.ensure_open(self.connection)?;
        Ok(state)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let mut state = self.broker()?;
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(TransportError::PreconditionFailed(format!(
                "inequivalent declaration for exchange '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.broker()?;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(TransportError::PreconditionFailed(
                format!("inequivalent declaration for queue '{}'", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), TransportError> {
        let mut state = self.broker()?;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(TransportError::NotFound(format!(
                "exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(TransportError::NotFound(format!("queue '{}'", binding.queue)));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.broker()?;
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(TransportError::NotFound(format!("exchange '{exchange}'")));
        }

        state.published += 1;
        let stored = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
            headers: message.headers,
            message_id: message.message_id,
            persistent: message.persistent,
            redelivered: false,
            enqueued_at: Instant::now(),
        };
        state.enqueue(exchange, routing_key, stored);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker()?;
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::NotFound(format!("queue '{queue}'")))?;
            if target.consumers.iter().any(|slot| slot.tag == consumer_tag) {
                return Err(TransportError::Protocol(format!(
                    "consumer tag '{consumer_tag}' already in use"
                )));
            }
            target.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                connection: self.connection,
                prefetch,
                in_flight: 0,
                sender,
            });
            state.dispatch(queue);
        }

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker()?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|slot| !(slot.tag == consumer_tag && slot.connection == self.connection));
        }
        Ok(())
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.status.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::SeqCst) {
            lock(&self.shared).release(self.connection);
            self.status
                .send_replace(LinkState::Closed("channel closed by client".to_string()));
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
    connection: u64,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<(), TransportError> {
        let shared = self
            .state
            .upgrade()
            .ok_or_else(|| TransportError::ChannelClosed("broker is gone".to_string()))?;
        let mut state = lock(&shared);
        state.settle(&self.queue, self.delivery_tag, self.connection, settlement)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(Settlement::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(Settlement::Reject { requeue })
    }
}
