//! Impure I/O side of the AMQP transport
//!
//! [`AmqpTransport`] owns the connection pair, the reconnect scheduler and the
//! subscription registry. All decisions are delegated to the pure modules in
//! this directory; this file only sequences them against the broker and the
//! tokio runtime.

use super::broker::{
    BrokerConnector, BrokerError, BrokerSession, DeliveryHandler, DeliveryInfo, ExchangeType,
    LinkEvent, LinkListener, PublishInfo, PublishOptions, QueueOptions, QueueStats,
    SubscribeOptions,
};
use super::connection::{
    log_state_transition, ChannelRole, ChannelSettings, ConnectionPair, ConnectionState,
    LinkAction,
};
use super::health::HealthMetrics;
use super::lapin_broker::LapinConnector;
use super::options::{
    resolve_options, BrokerOptionSelector, ConnectionOptions, DnsResolver, HostResolver,
};
use super::reconnect::{ReconnectGuard, ReconnectPolicy};
use super::subscriptions::{SubscriptionRegistry, TrackedConsumer};
use crate::error::TransportError;
use crate::transport::{ErrorHook, LifecycleHook, Transport};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Deferred "ready" signal, resolved once per connect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    /// Both connections of the given cycle are open
    Ready(u64),
}

#[derive(Default)]
struct Hooks {
    before_reconnect: Option<LifecycleHook>,
    after_reconnect: Option<LifecycleHook>,
    on_error: Option<ErrorHook>,
}

#[derive(Default)]
struct State {
    selector: BrokerOptionSelector,
    sessions: ConnectionPair,
    subscriptions: SubscriptionRegistry,
    deferred_cancellations: Vec<TrackedConsumer>,
    timeout: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
    connected_since: Option<Instant>,
    closed: bool,
}

struct Shared {
    connector: Arc<dyn BrokerConnector>,
    resolver: Arc<dyn HostResolver>,
    policy: ReconnectPolicy,
    runtime: Handle,
    guard: ReconnectGuard,
    cycle: AtomicU64,
    state: Mutex<State>,
    hooks: RwLock<Hooks>,
    ready_tx: watch::Sender<Readiness>,
}

/// Resilient AMQP transport with a primary (keepalive) and a secondary connection
///
/// Cloning is cheap; every clone drives the same connection pair.
#[derive(Clone)]
pub struct AmqpTransport {
    shared: Arc<Shared>,
}

impl AmqpTransport {
    /// Transport backed by lapin and the system resolver
    pub fn new() -> Result<Self, TransportError> {
        Self::with_connector(Arc::new(LapinConnector::new()), Arc::new(DnsResolver))
    }

    pub fn with_connector(
        connector: Arc<dyn BrokerConnector>,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self, TransportError> {
        Self::with_policy(connector, resolver, ReconnectPolicy::default())
    }

    /// Must be called from within a tokio runtime; timers and connection
    /// attempts are spawned on it.
    pub fn with_policy(
        connector: Arc<dyn BrokerConnector>,
        resolver: Arc<dyn HostResolver>,
        policy: ReconnectPolicy,
    ) -> Result<Self, TransportError> {
        policy
            .validate()
            .map_err(|message| TransportError::InvalidOptions { message })?;
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let (ready_tx, _) = watch::channel(Readiness::Pending);

        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                resolver,
                policy,
                runtime,
                guard: ReconnectGuard::default(),
                cycle: AtomicU64::new(0),
                state: Mutex::new(State::default()),
                hooks: RwLock::new(Hooks::default()),
                ready_tx,
            }),
        })
    }

    pub fn on_before_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.hooks.write().before_reconnect = Some(Arc::new(hook));
    }

    pub fn on_after_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.hooks.write().after_reconnect = Some(Arc::new(hook));
    }

    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.shared.hooks.write().on_error = Some(Arc::new(hook));
    }

    /// Reset all state and start connecting to one broker drawn from `pool`
    ///
    /// Returns immediately; await [`AmqpTransport::ready`] for the outcome.
    /// An empty pool connects with default options.
    pub fn connect(&self, pool: Vec<ConnectionOptions>) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            state.closed = false;
            if let Some(scheduler) = state.scheduler.take() {
                scheduler.abort();
            }
        }
        shared.guard.abandon();

        let cycle = shared.reset();
        shared.state.lock().selector.replace_pool(pool);
        info!(cycle, "Connecting to broker");

        shared.arm_timeout(cycle);
        shared.spawn_attempt(cycle);
    }

    /// Tear down and reconnect on a capped, incrementing cadence
    ///
    /// No-op while a reconnect sequence is already running, or when the
    /// transport is connected and `force` is false.
    pub fn reconnect(&self, force: bool) {
        self.shared.reconnect(force);
    }

    /// True iff both connections are established
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.guard.is_active()
    }

    pub fn readiness(&self) -> Readiness {
        *self.shared.ready_tx.borrow()
    }

    /// Wait until both connections of a cycle are open
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut ready_rx = self.shared.ready_tx.subscribe();
        ready_rx
            .wait_for(|readiness| matches!(readiness, Readiness::Ready(_)))
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Connection {
                message: "transport dropped before becoming ready".to_string(),
            })
    }

    /// Close both connections
    ///
    /// When a connection attempt is still in flight the teardown runs on the
    /// next scheduler turn so it never interrupts establishment halfway.
    pub fn close(&self) {
        let shared = Arc::clone(&self.shared);
        let (connected, cycle) = {
            let mut state = shared.state.lock();
            state.closed = true;
            if let Some(scheduler) = state.scheduler.take() {
                scheduler.abort();
            }
            if let Some(timeout) = state.timeout.take() {
                timeout.abort();
            }
            (
                state.sessions.is_established(),
                shared.cycle.load(Ordering::Acquire),
            )
        };
        shared.guard.abandon();

        if connected {
            shared.reset();
            info!("Transport closed");
        } else {
            self.shared.runtime.spawn(async move {
                tokio::task::yield_now().await;
                // A connect() issued since then owns the transport now
                let still_closed = shared.is_current(cycle) && shared.state.lock().closed;
                if still_closed {
                    shared.reset();
                    info!("Transport closed");
                } else {
                    debug!(cycle, "Transport reopened before deferred close ran");
                }
            });
        }
    }

    /// Publish `message` to `pipe`
    ///
    /// Keepalives go out on the primary connection, everything else on the
    /// secondary. While disconnected the message is dropped, a reconnect is
    /// requested and [`TransportError::NotConnected`] is returned.
    pub async fn publish(
        &self,
        exchange_type: ExchangeType,
        pipe: &str,
        message: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishInfo, TransportError> {
        let role = ChannelRole::for_pipe(pipe);
        let Some((session, _)) = self.shared.live_session(role) else {
            warn!(pipe = %pipe, "Transport not connected, dropping published message");
            self.shared.reconnect(false);
            return Err(TransportError::not_connected("publish"));
        };

        match session.publish(exchange_type, pipe, message, options).await {
            Ok(info) => {
                debug!(
                    pipe = %pipe,
                    exchange_type = %exchange_type,
                    channel = %role,
                    bytes = message.len(),
                    "Message published"
                );
                Ok(info)
            }
            Err(e) => Err(self.shared.protocol_failure("publish", &e)),
        }
    }

    /// Bind `funnel` to `pipe` and attach `handler` as its only consumer
    ///
    /// Subscribing to an already tracked funnel re-binds the route without
    /// attaching another consumer.
    pub async fn subscribe(
        &self,
        exchange_type: ExchangeType,
        pipe: &str,
        funnel: &str,
        options: &SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        let role = ChannelRole::for_pipe(pipe);
        let Some((session, cycle, claimed)) = self.shared.claim_funnel(role, funnel) else {
            self.shared.disconnected_failure("subscribe");
            return;
        };

        if claimed {
            if let Err(e) = session.declare_queue(funnel, &QueueOptions::default()).await {
                self.shared.release_claim(funnel, cycle);
                self.shared.protocol_failure("subscribe", &e);
                return;
            }
        }

        if let Err(e) = session
            .bind_queue(funnel, exchange_type, pipe, &options.routing_key)
            .await
        {
            if claimed {
                self.shared.release_claim(funnel, cycle);
            }
            self.shared.protocol_failure("subscribe", &e);
            return;
        }

        if !claimed {
            debug!(funnel = %funnel, pipe = %pipe, "Funnel already consumed, route re-bound");
            return;
        }

        let handler: Arc<dyn DeliveryHandler> = Arc::new(CycleStampedHandler { cycle, handler });
        match session.consume(funnel, options, handler).await {
            Ok(consumer_tag) => {
                let attached = {
                    let mut state = self.shared.state.lock();
                    self.shared.is_current(cycle)
                        && state.subscriptions.attach(funnel, consumer_tag.clone())
                };
                if attached {
                    info!(
                        funnel = %funnel,
                        pipe = %pipe,
                        channel = %role,
                        consumer_tag = %consumer_tag,
                        "Subscribed"
                    );
                } else {
                    debug!(funnel = %funnel, "Consumer attached to a session that was since reset");
                }
            }
            Err(e) => {
                self.shared.release_claim(funnel, cycle);
                self.shared.protocol_failure("subscribe", &e);
            }
        }
    }

    /// Cancel every tracked consumer and ask the broker to redeliver unacked messages
    ///
    /// While disconnected the cancellations are deferred until the next
    /// connection pair is ready.
    pub async fn unsubscribe(&self) {
        let (consumers, sessions) = {
            let mut state = self.shared.state.lock();
            let consumers = state.subscriptions.drain();
            if state.sessions.is_established() {
                (consumers, state.sessions.clone())
            } else {
                debug!(
                    deferred = consumers.len(),
                    "Transport not connected, deferring consumer cancellation"
                );
                state.deferred_cancellations.extend(consumers);
                return;
            }
        };

        for consumer in &consumers {
            let Some(session) = sessions.get(consumer.channel) else {
                continue;
            };
            if let Err(e) = session.cancel(&consumer.consumer_tag).await {
                self.shared.protocol_failure("unsubscribe", &e);
            } else {
                debug!(funnel = %consumer.funnel, consumer_tag = %consumer.consumer_tag, "Consumer cancelled");
            }
        }

        for session in [&sessions.primary, &sessions.secondary].into_iter().flatten() {
            if let Err(e) = session.recover().await {
                self.shared.protocol_failure("unsubscribe", &e);
            }
        }

        info!(cancelled = consumers.len(), "Unsubscribed");
    }

    /// Acknowledge a delivery on the channel it arrived on
    ///
    /// Deliveries from a connection that has since been replaced are not
    /// acknowledged; the broker already requeued them when that channel
    /// closed. They are reported as [`TransportError::StaleDelivery`].
    pub async fn acknowledge(&self, info: &DeliveryInfo) {
        let Some((session, cycle)) = self.shared.live_session(info.channel) else {
            self.shared.disconnected_failure("acknowledge");
            return;
        };

        if info.cycle != cycle {
            debug!(
                delivery_tag = info.delivery_tag,
                delivery_cycle = info.cycle,
                cycle,
                "Dropping acknowledgement for a delivery from a previous connection"
            );
            self.shared.report(&TransportError::StaleDelivery {
                delivery_tag: info.delivery_tag,
            });
            return;
        }

        if let Err(e) = session.ack(info.delivery_tag).await {
            self.shared.protocol_failure("acknowledge", &e);
        }
    }

    /// Message and consumer counts of `funnel`, declaring it if needed
    pub async fn stats(
        &self,
        funnel: &str,
        options: &QueueOptions,
    ) -> Result<QueueStats, TransportError> {
        let Some((session, _)) = self.shared.live_session(ChannelRole::Secondary) else {
            self.shared.reconnect(false);
            return Err(TransportError::not_connected("stats"));
        };

        session
            .declare_queue(funnel, options)
            .await
            .map_err(|e| self.shared.protocol_failure("stats", &e))
    }

    /// Current connection health
    pub fn health(&self) -> HealthMetrics {
        let state = self.shared.state.lock();
        HealthMetrics::calculate(
            state.connected_since,
            self.shared.guard.completed(),
            state.sessions.is_established(),
            self.shared.guard.is_active(),
        )
    }

    /// Number of funnels consumed this session
    pub fn subscription_count(&self) -> usize {
        self.shared.state.lock().subscriptions.len()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }
}

impl Shared {
    fn is_current(&self, cycle: u64) -> bool {
        self.cycle.load(Ordering::Acquire) == cycle
    }

    fn is_connected(&self) -> bool {
        self.state.lock().sessions.is_established()
    }

    /// Session for `role` plus the cycle it belongs to, only when fully connected
    fn live_session(&self, role: ChannelRole) -> Option<(Arc<dyn BrokerSession>, u64)> {
        let state = self.state.lock();
        if !state.sessions.is_established() {
            return None;
        }
        let session = state.sessions.get(role)?.clone();
        Some((session, self.cycle.load(Ordering::Acquire)))
    }

    /// Like `live_session`, also claiming `funnel` under the same lock
    fn claim_funnel(
        &self,
        role: ChannelRole,
        funnel: &str,
    ) -> Option<(Arc<dyn BrokerSession>, u64, bool)> {
        let mut state = self.state.lock();
        if !state.sessions.is_established() {
            return None;
        }
        let session = state.sessions.get(role)?.clone();
        let claimed = state.subscriptions.claim(funnel, role);
        Some((session, self.cycle.load(Ordering::Acquire), claimed))
    }

    fn release_claim(&self, funnel: &str, cycle: u64) {
        let mut state = self.state.lock();
        if self.is_current(cycle) {
            state.subscriptions.release(funnel);
        }
    }

    fn report(&self, error: &TransportError) {
        let hook = self.hooks.read().on_error.clone();
        match hook {
            Some(hook) => hook(error),
            None => warn!(error = %error, "Unhandled transport error"),
        }
    }

    /// Forward a broker error raised by `operation` and hand it back
    ///
    /// The broker closes a channel on most protocol errors; when that left
    /// the pair broken, a reconnect is started.
    fn protocol_failure(self: &Arc<Self>, operation: &str, source: &BrokerError) -> TransportError {
        let error = TransportError::protocol(operation, source);
        debug!(operation = %operation, error = %source, "Broker rejected operation");
        self.report(&error);
        self.recover_closed_channel();
        error
    }

    /// Reconnect when a channel of the current pair was closed under us
    fn recover_closed_channel(self: &Arc<Self>) {
        let broken = {
            let state = self.state.lock();
            state.sessions.state() == ConnectionState::Connecting
        };
        if broken {
            info!("Broker closed a channel, rebuilding the connection pair");
            self.reconnect(false);
        }
    }

    fn disconnected_failure(self: &Arc<Self>, operation: &str) {
        self.reconnect(false);
        self.report(&TransportError::not_connected(operation));
    }

    /// Drop sessions, subscriptions and the timeout; start a new cycle
    fn reset(&self) -> u64 {
        let (cycle, previous, sessions) = {
            let mut state = self.state.lock();
            let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
            if let Some(timeout) = state.timeout.take() {
                timeout.abort();
            }
            state.subscriptions.clear();
            state.connected_since = None;
            let previous = state.sessions.state();
            let sessions = state.sessions.take();
            self.ready_tx.send_replace(Readiness::Pending);
            (cycle, previous, sessions)
        };

        if previous != ConnectionState::Disconnected {
            log_state_transition(&previous, &ConnectionState::Disconnected);
        }
        self.close_sessions(sessions);
        cycle
    }

    fn close_sessions(&self, sessions: Vec<Arc<dyn BrokerSession>>) {
        if sessions.is_empty() {
            return;
        }
        self.runtime.spawn(async move {
            for session in sessions {
                session.close().await;
            }
        });
    }

    fn arm_timeout(self: &Arc<Self>, cycle: u64) {
        let weak = Arc::downgrade(self);
        let timeout = self.policy.connect_timeout;

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.is_current(cycle) && !shared.is_connected() {
                warn!(timeout_secs = timeout.as_secs(), "Timed out connecting to broker");
                shared.reconnect(true);
            }
        });

        if let Some(previous) = self.state.lock().timeout.replace(handle) {
            previous.abort();
        }
    }

    fn spawn_attempt(self: &Arc<Self>, cycle: u64) {
        let shared = Arc::clone(self);
        self.runtime.spawn(
            async move {
                shared.attempt(cycle).await;
            }
            .instrument(crate::connection_span!(cycle)),
        );
    }

    /// Draw one option set and open both connections against it
    async fn attempt(self: Arc<Self>, cycle: u64) {
        let options = self.state.lock().selector.next();
        let options = match resolve_options(options, self.resolver.as_ref()).await {
            Ok(options) => options,
            Err(error) => {
                warn!(error = %error, "Broker host resolution failed");
                if self.is_current(cycle) {
                    self.reconnect(true);
                }
                return;
            }
        };

        if !self.is_current(cycle) {
            debug!(cycle, "Connection attempt superseded before opening");
            return;
        }

        let settings = ChannelSettings::from_options(&options);
        debug!(
            cycle,
            broker = %options.redacted(),
            prefetch = settings.prefetch,
            "Opening primary and secondary connections"
        );

        let (primary, secondary) = tokio::join!(
            self.connector.open(
                &options,
                settings,
                ChannelRole::Primary,
                self.listener(ChannelRole::Primary, cycle),
            ),
            self.connector.open(
                &options,
                settings,
                ChannelRole::Secondary,
                self.listener(ChannelRole::Secondary, cycle),
            ),
        );

        match (primary, secondary) {
            (Ok(primary), Ok(secondary)) => self.establish(cycle, primary, secondary),
            (primary, secondary) => {
                let mut opened = Vec::new();
                for (role, result) in [
                    (ChannelRole::Primary, primary),
                    (ChannelRole::Secondary, secondary),
                ] {
                    match result {
                        Ok(session) => opened.push(session),
                        Err(error) => attempt_failure_event(error).log(role),
                    }
                }
                self.close_sessions(opened);

                if self.is_current(cycle) {
                    self.reconnect(true);
                }
            }
        }
    }

    fn establish(
        &self,
        cycle: u64,
        primary: Arc<dyn BrokerSession>,
        secondary: Arc<dyn BrokerSession>,
    ) {
        let mut state = self.state.lock();
        if state.closed || !self.is_current(cycle) {
            drop(state);
            debug!(cycle, "Discarding connections from a superseded attempt");
            self.close_sessions(vec![primary, secondary]);
            return;
        }

        state.sessions.set(ChannelRole::Primary, primary);
        state.sessions.set(ChannelRole::Secondary, secondary);
        if let Some(timeout) = state.timeout.take() {
            timeout.abort();
        }
        state.connected_since = Some(Instant::now());
        let deferred = std::mem::take(&mut state.deferred_cancellations);
        let sessions = state.sessions.clone();
        self.ready_tx.send_replace(Readiness::Ready(cycle));
        drop(state);

        log_state_transition(&ConnectionState::Connecting, &ConnectionState::Connected);

        if !deferred.is_empty() {
            self.flush_deferred(sessions, deferred);
        }

        if self.guard.finish() {
            info!(reconnects = self.guard.completed(), "Reconnected to broker");
            let hook = self.hooks.read().after_reconnect.clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Cancel consumers that were unsubscribed while disconnected
    fn flush_deferred(&self, sessions: ConnectionPair, deferred: Vec<TrackedConsumer>) {
        self.runtime.spawn(async move {
            for consumer in deferred {
                let Some(session) = sessions.get(consumer.channel) else {
                    continue;
                };
                // The consumer may have died with its old connection
                if let Err(error) = session.cancel(&consumer.consumer_tag).await {
                    debug!(
                        funnel = %consumer.funnel,
                        consumer_tag = %consumer.consumer_tag,
                        error = %error,
                        "Deferred consumer cancel failed"
                    );
                }
            }
        });
    }

    fn reconnect(self: &Arc<Self>, force: bool) {
        {
            let state = self.state.lock();
            if state.closed {
                debug!("Transport closed, ignoring reconnect request");
                return;
            }
            if !force && state.sessions.is_established() {
                debug!("Transport connected, ignoring reconnect request");
                return;
            }
        }

        if !self.guard.try_begin() {
            debug!("Reconnect already in progress");
            return;
        }

        info!(force, "Reconnecting to broker");
        let hook = self.hooks.read().before_reconnect.clone();
        if let Some(hook) = hook {
            hook();
        }

        self.reset();

        let handle = self
            .runtime
            .spawn(run_scheduler(Arc::downgrade(self), self.policy.first_delay()));
        if let Some(previous) = self.state.lock().scheduler.replace(handle) {
            previous.abort();
        }
    }

    fn listener(self: &Arc<Self>, role: ChannelRole, cycle: u64) -> LinkListener {
        let weak = Arc::downgrade(self);
        Arc::new(move |event: LinkEvent| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !shared.is_current(cycle) {
                debug!(channel = %role, cycle, event = ?event, "Ignoring event from a previous connection");
                return;
            }

            event.log(role);
            match event.action() {
                LinkAction::Reconnect => shared.reconnect(true),
                LinkAction::ForwardError(message) => {
                    shared.report(&TransportError::channel(message));
                    shared.recover_closed_channel();
                }
                LinkAction::Ignore => {}
            }
        })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for handle in [state.scheduler.take(), state.timeout.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Retry on a capped, incrementing cadence until a connection pair is ready
async fn run_scheduler(weak: Weak<Shared>, first_delay: Duration) {
    let mut delay = first_delay;
    let mut attempt: u32 = 0;

    loop {
        tokio::time::sleep(delay).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.is_connected() {
            debug!(attempts = attempt, "Reconnect scheduler stopping, transport connected");
            return;
        }

        attempt += 1;
        let cycle = shared.reset();
        delay = shared.policy.next_delay(delay);
        info!(
            attempt,
            cycle,
            next_delay_secs = delay.as_secs(),
            "Attempting broker reconnect"
        );
        shared.spawn_attempt(cycle);
    }
}

/// Tags each delivery with the connect cycle of the channel it came from
struct CycleStampedHandler {
    cycle: u64,
    handler: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl DeliveryHandler for CycleStampedHandler {
    async fn handle(&self, mut info: DeliveryInfo, payload: Vec<u8>) {
        info.cycle = self.cycle;
        self.handler.handle(info, payload).await;
    }
}

/// Map a failed open to the event it stands for; unexpected errors are
/// swallowed here because the next scheduler tick retries anyway
fn attempt_failure_event(error: BrokerError) -> LinkEvent {
    match error {
        BrokerError::Connect(reason) => LinkEvent::ConnectFailed(reason),
        BrokerError::Authentication { user } => LinkEvent::PossibleAuthenticationFailure { user },
        other => {
            debug!(error = ?other, "Swallowed error during connection attempt");
            LinkEvent::ConnectFailed(other.to_string())
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn connect(&self, pool: Vec<ConnectionOptions>) {
        AmqpTransport::connect(self, pool);
    }

    fn reconnect(&self, force: bool) {
        AmqpTransport::reconnect(self, force);
    }

    fn is_connected(&self) -> bool {
        AmqpTransport::is_connected(self)
    }

    fn close(&self) {
        AmqpTransport::close(self);
    }

    async fn ready(&self) -> Result<(), TransportError> {
        AmqpTransport::ready(self).await
    }

    async fn publish(
        &self,
        exchange_type: ExchangeType,
        pipe: &str,
        message: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishInfo, TransportError> {
        AmqpTransport::publish(self, exchange_type, pipe, message, options).await
    }

    async fn subscribe(
        &self,
        exchange_type: ExchangeType,
        pipe: &str,
        funnel: &str,
        options: &SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        AmqpTransport::subscribe(self, exchange_type, pipe, funnel, options, handler).await;
    }

    async fn unsubscribe(&self) {
        AmqpTransport::unsubscribe(self).await;
    }

    async fn acknowledge(&self, info: &DeliveryInfo) {
        AmqpTransport::acknowledge(self, info).await;
    }

    async fn stats(
        &self,
        funnel: &str,
        options: &QueueOptions,
    ) -> Result<QueueStats, TransportError> {
        AmqpTransport::stats(self, funnel, options).await
    }

    fn set_before_reconnect(&self, hook: LifecycleHook) {
        self.shared.hooks.write().before_reconnect = Some(hook);
    }

    fn set_after_reconnect(&self, hook: LifecycleHook) {
        self.shared.hooks.write().after_reconnect = Some(hook);
    }

    fn set_on_error(&self, hook: ErrorHook) {
        self.shared.hooks.write().on_error = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBroker, MockResolver};

    fn transport(broker: &MockBroker) -> AmqpTransport {
        AmqpTransport::with_connector(Arc::new(broker.clone()), Arc::new(MockResolver::new()))
            .unwrap()
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result =
            AmqpTransport::with_connector(Arc::new(MockBroker::new()), Arc::new(MockResolver::new()));
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_invalid_policy_is_rejected() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::ZERO,
            ..Default::default()
        };
        let result = AmqpTransport::with_policy(
            Arc::new(MockBroker::new()),
            Arc::new(MockResolver::new()),
            policy,
        );
        assert!(matches!(result, Err(TransportError::InvalidOptions { .. })));
    }

    #[tokio::test]
    async fn test_starts_pending_and_disconnected() {
        let broker = MockBroker::new();
        let transport = transport(&broker);

        assert_eq!(transport.readiness(), Readiness::Pending);
        assert!(!transport.is_connected());
        assert!(!transport.is_reconnecting());
        assert_eq!(broker.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_connect() {
        let broker = MockBroker::new();
        let transport = transport(&broker);

        transport.connect(vec![ConnectionOptions::for_host("10.0.0.1")]);
        transport.ready().await.unwrap();

        assert!(transport.is_connected());
        assert!(matches!(transport.readiness(), Readiness::Ready(_)));
        assert!(transport.health().is_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_while_disconnected_requests_reconnect() {
        let broker = MockBroker::new();
        let transport = transport(&broker);

        let result = transport.stats("results", &QueueOptions::default()).await;

        assert!(matches!(result, Err(TransportError::NotConnected { .. })));
        assert!(transport.is_reconnecting());
    }

    #[test]
    fn test_attempt_failure_event_mapping() {
        assert_eq!(
            attempt_failure_event(BrokerError::Connect("refused".to_string())),
            LinkEvent::ConnectFailed("refused".to_string())
        );
        assert_eq!(
            attempt_failure_event(BrokerError::Authentication {
                user: "sensu".to_string()
            }),
            LinkEvent::PossibleAuthenticationFailure {
                user: "sensu".to_string()
            }
        );
        assert!(matches!(
            attempt_failure_event(BrokerError::ChannelClosed),
            LinkEvent::ConnectFailed(_)
        ));
    }
}
