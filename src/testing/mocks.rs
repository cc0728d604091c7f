//! Mock implementations for testing
//!
//! Provides an in-memory broker and resolver so the transport state machine
//! can be exercised without a running RabbitMQ.

use crate::error::TransportError;
use crate::transport::amqp::broker::{
    BrokerConnector, BrokerError, BrokerSession, DeliveryHandler, DeliveryInfo, ExchangeType,
    LinkEvent, LinkListener, PublishInfo, PublishOptions, QueueOptions, QueueStats,
    SubscribeOptions,
};
use crate::transport::amqp::connection::{ChannelRole, ChannelSettings};
use crate::transport::amqp::options::{ConnectionOptions, HostResolver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// One call to [`BrokerConnector::open`]
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub role: ChannelRole,
    pub options: ConnectionOptions,
    pub settings: ChannelSettings,
    pub at: tokio::time::Instant,
}

/// A message accepted by the mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub channel: ChannelRole,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct MockConsumer {
    tag: String,
    session: Weak<MockSession>,
    handler: Arc<dyn DeliveryHandler>,
}

#[derive(Default)]
struct MockQueue {
    auto_delete: bool,
    backlog: VecDeque<(String, String, Vec<u8>)>,
    consumers: Vec<MockConsumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    attempts: Vec<ConnectAttempt>,
    sessions: Vec<Arc<MockSession>>,
    failing_roles: HashSet<ChannelRole>,
    stalled_roles: HashSet<ChannelRole>,
    reject_credentials: bool,
    failing_operations: HashSet<String>,
    channel_closing_operations: HashSet<String>,
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, MockQueue>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    cancelled: Vec<String>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    released: Notify,
}

/// In-memory broker that routes published messages to bound queues
///
/// Cloning shares the same broker.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                released: Notify::new(),
            }),
        }
    }

    /// Refuse TCP connections for `role`
    pub fn fail_role(&self, role: ChannelRole) {
        self.inner.state.lock().failing_roles.insert(role);
    }

    pub fn fail_all(&self) {
        let mut state = self.inner.state.lock();
        state.failing_roles.insert(ChannelRole::Primary);
        state.failing_roles.insert(ChannelRole::Secondary);
    }

    /// Close every handshake as if the credentials were wrong
    pub fn reject_credentials(&self) {
        self.inner.state.lock().reject_credentials = true;
    }

    /// Leave `open` for `role` pending until [`MockBroker::heal`]
    pub fn stall_role(&self, role: ChannelRole) {
        self.inner.state.lock().stalled_roles.insert(role);
    }

    /// Make a session operation (`publish`, `bind_queue`, `ack`, ...) fail
    pub fn fail_operation(&self, operation: &str) {
        self.inner
            .state
            .lock()
            .failing_operations
            .insert(operation.to_string());
    }

    /// Make `operation` fail with a channel-level exception that closes the
    /// channel it ran on, without an asynchronous error notification
    pub fn close_channel_on(&self, operation: &str) {
        self.inner
            .state
            .lock()
            .channel_closing_operations
            .insert(operation.to_string());
    }

    /// Clear every injected failure and release stalled connections
    pub fn heal(&self) {
        {
            let mut state = self.inner.state.lock();
            state.failing_roles.clear();
            state.stalled_roles.clear();
            state.reject_credentials = false;
            state.failing_operations.clear();
            state.channel_closing_operations.clear();
        }
        self.inner.released.notify_waiters();
    }

    /// Drop every open connection, reporting `Lost` on each
    pub fn drop_connections(&self) {
        let sessions: Vec<Arc<MockSession>> = self.inner.state.lock().sessions.clone();
        for session in sessions.iter().filter(|s| s.is_open()) {
            session.sever(LinkEvent::Lost("connection reset by peer".to_string()));
        }
    }

    /// Drop the newest open connection of `role`
    pub fn drop_role(&self, role: ChannelRole) {
        if let Some(session) = self.latest_open(role) {
            session.sever(LinkEvent::Lost("connection reset by peer".to_string()));
        }
    }

    /// Report missed heartbeats on the newest open connection of `role`
    pub fn miss_heartbeats(&self, role: ChannelRole) {
        if let Some(session) = self.latest_open(role) {
            session.sever(LinkEvent::HeartbeatMissed);
        }
    }

    /// Close the channel of the newest open session of `role` with an error,
    /// the way a broker answers a channel-level exception
    pub fn raise_channel_error(&self, role: ChannelRole, message: &str) {
        if let Some(session) = self.latest_open(role) {
            session.sever(LinkEvent::ChannelError(message.to_string()));
        }
    }

    fn latest_open(&self, role: ChannelRole) -> Option<Arc<MockSession>> {
        self.inner
            .state
            .lock()
            .sessions
            .iter()
            .rev()
            .find(|s| s.role == role && s.is_open())
            .cloned()
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.inner.state.lock().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.inner.state.lock().attempts.len()
    }

    /// Attempts for the primary role only, one per connect cycle
    pub fn primary_attempts(&self) -> Vec<ConnectAttempt> {
        self.attempts()
            .into_iter()
            .filter(|attempt| attempt.role == ChannelRole::Primary)
            .collect()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.inner.state.lock().sessions.clone()
    }

    pub fn open_sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions().into_iter().filter(|s| s.is_open()).collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().published.clone()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .count()
    }

    /// Consumer tags cancelled through `basic.cancel`
    pub fn cancelled(&self) -> Vec<String> {
        self.inner.state.lock().cancelled.clone()
    }

    fn operation_fails(&self, operation: &str) -> Option<BrokerError> {
        self.inner
            .state
            .lock()
            .failing_operations
            .contains(operation)
            .then(|| BrokerError::Protocol(format!("{operation} rejected by mock broker")))
    }

    fn operation_closes_channel(&self, operation: &str) -> bool {
        self.inner
            .state
            .lock()
            .channel_closing_operations
            .contains(operation)
    }

    /// Remove every consumer owned by `session`, deleting emptied auto-delete queues
    fn detach_consumers(&self, session: &MockSession) {
        let mut state = self.inner.state.lock();
        let mut deleted = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                consumer
                    .session
                    .upgrade()
                    .is_some_and(|owner| !std::ptr::eq(owner.as_ref(), session))
            });
            if before > 0 && queue.consumers.is_empty() && queue.auto_delete {
                deleted.push(name.clone());
            }
        }
        for name in deleted {
            state.queues.remove(&name);
            state.bindings.retain(|binding| binding.queue != name);
        }
    }

    /// Route a message to every matching queue, returning deliveries to make
    fn route(
        state: &mut BrokerState,
        exchange_type: ExchangeType,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Vec<(Arc<MockSession>, Arc<dyn DeliveryHandler>, String)> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            state
                .bindings
                .iter()
                .filter(|binding| binding.exchange == exchange)
                .filter(|binding| routes(exchange_type, &binding.routing_key, routing_key))
                .map(|binding| binding.queue.clone())
                .collect()
        };

        let mut deliveries = Vec::new();
        let mut seen = HashSet::new();
        for name in targets {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(queue) = state.queues.get_mut(&name) else {
                continue;
            };
            match next_consumer(queue) {
                Some((session, handler, tag)) => deliveries.push((session, handler, tag)),
                None => queue.backlog.push_back((
                    exchange.to_string(),
                    routing_key.to_string(),
                    payload.to_vec(),
                )),
            }
        }
        deliveries
    }
}

fn next_consumer(queue: &mut MockQueue) -> Option<(Arc<MockSession>, Arc<dyn DeliveryHandler>, String)> {
    queue
        .consumers
        .retain(|consumer| consumer.session.upgrade().is_some_and(|s| s.is_open()));
    if queue.consumers.is_empty() {
        return None;
    }
    let index = queue.next_consumer % queue.consumers.len();
    queue.next_consumer = queue.next_consumer.wrapping_add(1);
    let consumer = &queue.consumers[index];
    let session = consumer.session.upgrade()?;
    Some((session, consumer.handler.clone(), consumer.tag.clone()))
}

/// Direct and topic routing; `*` matches one word, `#` any number
fn routes(exchange_type: ExchangeType, binding_key: &str, routing_key: &str) -> bool {
    match exchange_type {
        ExchangeType::Fanout => true,
        ExchangeType::Direct => binding_key == routing_key,
        ExchangeType::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn open(
        &self,
        options: &ConnectionOptions,
        settings: ChannelSettings,
        role: ChannelRole,
        listener: LinkListener,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        self.inner.state.lock().attempts.push(ConnectAttempt {
            role,
            options: options.clone(),
            settings,
            at: tokio::time::Instant::now(),
        });

        loop {
            let released = self.inner.released.notified();
            let stalled = self.inner.state.lock().stalled_roles.contains(&role);
            if !stalled {
                break;
            }
            released.await;
        }

        {
            let state = self.inner.state.lock();
            if state.reject_credentials {
                return Err(BrokerError::Authentication {
                    user: options.user().to_string(),
                });
            }
            if state.failing_roles.contains(&role) {
                return Err(BrokerError::Connect(format!(
                    "connection refused: {}",
                    options.endpoint()
                )));
            }
        }

        let session = Arc::new(MockSession {
            role,
            options: options.clone(),
            settings,
            broker: Arc::downgrade(&self.inner),
            listener,
            open: AtomicBool::new(true),
            next_delivery_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashSet::new()),
            acked: Mutex::new(Vec::new()),
            recover_count: AtomicU32::new(0),
        });
        self.inner.state.lock().sessions.push(Arc::clone(&session));
        Ok(session as Arc<dyn BrokerSession>)
    }
}

/// One mock connection with its channel
pub struct MockSession {
    pub role: ChannelRole,
    pub options: ConnectionOptions,
    pub settings: ChannelSettings,
    broker: Weak<BrokerInner>,
    listener: LinkListener,
    open: AtomicBool,
    next_delivery_tag: AtomicU64,
    unacked: Mutex<HashSet<u64>>,
    acked: Mutex<Vec<u64>>,
    recover_count: AtomicU32,
}

impl MockSession {
    fn broker(&self) -> Result<MockBroker, BrokerError> {
        self.broker
            .upgrade()
            .map(|inner| MockBroker { inner })
            .ok_or(BrokerError::ChannelClosed)
    }

    /// Broker handle, failing if the channel is closed or `operation` is rigged
    fn checked(&self, operation: &str) -> Result<MockBroker, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        let broker = self.broker()?;
        if broker.operation_closes_channel(operation) {
            self.open.store(false, Ordering::Release);
            broker.detach_consumers(self);
            return Err(BrokerError::Protocol(format!(
                "CHANNEL_ERROR - {operation} closed the channel"
            )));
        }
        match broker.operation_fails(operation) {
            Some(error) => Err(error),
            None => Ok(broker),
        }
    }

    /// Close the connection from the broker side and notify the transport
    fn sever(&self, event: LinkEvent) {
        self.open.store(false, Ordering::Release);
        if let Ok(broker) = self.broker() {
            broker.detach_consumers(self);
        }
        (self.listener)(event);
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }

    pub fn recover_count(&self) -> u32 {
        self.recover_count.load(Ordering::Relaxed)
    }

    async fn deliver(
        self: Arc<Self>,
        handler: Arc<dyn DeliveryHandler>,
        consumer_tag: String,
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
    ) {
        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
        self.unacked.lock().insert(delivery_tag);
        let info = DeliveryInfo {
            delivery_tag,
            exchange,
            routing_key,
            redelivered: false,
            consumer_tag,
            channel: self.role,
            cycle: 0,
        };
        handler.handle(info, payload).await;
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    fn role(&self) -> ChannelRole {
        self.role
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn publish(
        &self,
        exchange_type: ExchangeType,
        exchange: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishInfo, BrokerError> {
        let broker = self.checked("publish")?;

        let deliveries = {
            let mut state = broker.inner.state.lock();
            if !exchange.is_empty() {
                match state.exchanges.get(exchange) {
                    Some(existing) if *existing != exchange_type => {
                        return Err(BrokerError::Protocol(format!(
                            "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{exchange}'"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        state.exchanges.insert(exchange.to_string(), exchange_type);
                    }
                }
            }
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                exchange_type,
                routing_key: options.routing_key.clone(),
                channel: self.role,
                payload: payload.to_vec(),
            });
            MockBroker::route(
                &mut state,
                exchange_type,
                exchange,
                &options.routing_key,
                payload,
            )
        };

        for (session, handler, tag) in deliveries {
            session
                .deliver(
                    handler,
                    tag,
                    exchange.to_string(),
                    options.routing_key.clone(),
                    payload.to_vec(),
                )
                .await;
        }

        Ok(PublishInfo {
            exchange: exchange.to_string(),
            exchange_type,
            routing_key: options.routing_key.clone(),
            channel: self.role,
            acked: false,
        })
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueStats, BrokerError> {
        let broker = self.checked("declare_queue")?;
        let mut state = broker.inner.state.lock();
        let declared = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MockQueue {
                auto_delete: options.auto_delete,
                ..Default::default()
            });

        Ok(QueueStats {
            messages: u32::try_from(declared.backlog.len()).unwrap_or(u32::MAX),
            consumers: u32::try_from(declared.consumers.len()).unwrap_or(u32::MAX),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange_type: ExchangeType,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let broker = self.checked("bind_queue")?;
        let mut state = broker.inner.state.lock();

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Protocol(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        if let Some(existing) = state.exchanges.get(exchange) {
            if *existing != exchange_type {
                return Err(BrokerError::Protocol(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{exchange}'"
                )));
            }
        }
        state.exchanges.insert(exchange.to_string(), exchange_type);

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: &SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, BrokerError> {
        let broker = self.checked("consume")?;
        let consumer_tag = format!("{queue}-{}", uuid::Uuid::new_v4());

        let (owner, backlog) = {
            let mut state = broker.inner.state.lock();
            let owner = state
                .sessions
                .iter()
                .find(|s| std::ptr::eq(s.as_ref(), self))
                .cloned()
                .ok_or(BrokerError::ChannelClosed)?;
            let Some(declared) = state.queues.get_mut(queue) else {
                return Err(BrokerError::Protocol(format!(
                    "NOT_FOUND - no queue '{queue}'"
                )));
            };
            declared.consumers.push(MockConsumer {
                tag: consumer_tag.clone(),
                session: Arc::downgrade(&owner),
                handler: Arc::clone(&handler),
            });
            (owner, std::mem::take(&mut declared.backlog))
        };

        for (exchange, routing_key, payload) in backlog {
            Arc::clone(&owner)
                .deliver(
                    Arc::clone(&handler),
                    consumer_tag.clone(),
                    exchange,
                    routing_key,
                    payload,
                )
                .await;
        }

        Ok(consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let broker = self.checked("cancel")?;
        let mut state = broker.inner.state.lock();
        state.cancelled.push(consumer_tag.to_string());

        let mut deleted = None;
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
            if before != queue.consumers.len() && queue.consumers.is_empty() && queue.auto_delete
            {
                deleted = Some(name.clone());
            }
        }
        if let Some(name) = deleted {
            state.queues.remove(&name);
            state.bindings.retain(|binding| binding.queue != name);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.checked("ack")?;
        if !self.unacked.lock().remove(&delivery_tag) {
            return Err(BrokerError::Protocol(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }
        self.acked.lock().push(delivery_tag);
        Ok(())
    }

    async fn recover(&self) -> Result<(), BrokerError> {
        self.checked("recover")?;
        self.recover_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            if let Ok(broker) = self.broker() {
                broker.detach_consumers(self);
            }
        }
    }
}

/// Resolver with a fixed host table that records every lookup
#[derive(Debug, Default, Clone)]
pub struct MockResolver {
    hosts: Arc<Mutex<HashMap<String, IpAddr>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, address: IpAddr) -> Self {
        self.hosts.lock().insert(host.to_string(), address);
        self
    }

    pub fn remove_host(&self, host: &str) {
        self.hosts.lock().remove(host);
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl HostResolver for MockResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError> {
        self.lookups.lock().push(host.to_string());
        self.hosts
            .lock()
            .get(host)
            .copied()
            .ok_or_else(|| TransportError::Resolution {
                host: host.to_string(),
                reason: "no such host".to_string(),
            })
    }
}
