//! Seam over the broker client library
//!
//! The transport state machine only talks to these traits. The production
//! implementation lives in [`super::lapin_broker`]; tests use
//! [`crate::testing::MockBroker`].

use super::connection::{ChannelRole, ChannelSettings};
use super::options::ConnectionOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Routing topology of a pipe (exchange)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Some(ExchangeType::Direct),
            "fanout" => Some(ExchangeType::Fanout),
            "topic" => Some(ExchangeType::Topic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a single publish
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub persistent: bool,
    pub content_type: Option<String>,
}

/// Options for attaching a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Deliveries must be acknowledged explicitly via `acknowledge`
    #[serde(default = "default_ack")]
    pub ack: bool,
    #[serde(default)]
    pub routing_key: String,
}

fn default_ack() -> bool {
    true
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            ack: true,
            routing_key: String::new(),
        }
    }
}

/// Options used when declaring a funnel (queue)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    #[serde(default = "default_auto_delete")]
    pub auto_delete: bool,
    #[serde(default)]
    pub durable: bool,
}

fn default_auto_delete() -> bool {
    true
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            auto_delete: true,
            durable: false,
        }
    }
}

/// Result of a confirmed publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishInfo {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub channel: ChannelRole,
    /// Broker acknowledged the message (only when publisher confirms are on)
    pub acked: bool,
}

/// Queue depth and consumer count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub messages: u32,
    pub consumers: u32,
}

/// Metadata accompanying each delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub consumer_tag: String,
    /// Channel the delivery arrived on; acknowledgements go back to it
    pub channel: ChannelRole,
    /// Connect cycle whose channel made the delivery. Delivery tags are only
    /// meaningful on that channel, so acks from older cycles are refused.
    #[serde(default)]
    pub cycle: u64,
}

/// Consumer callback, invoked once per delivery
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, info: DeliveryInfo, payload: Vec<u8>);
}

#[async_trait]
impl DeliveryHandler for tokio::sync::mpsc::UnboundedSender<(DeliveryInfo, Vec<u8>)> {
    async fn handle(&self, info: DeliveryInfo, payload: Vec<u8>) {
        let _ = self.send((info, payload));
    }
}

/// Connection-level signals reported by a broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// TCP connection could not be established
    ConnectFailed(String),
    /// Established TCP connection was lost
    Lost(String),
    /// Broker heartbeats stopped arriving
    HeartbeatMissed,
    /// Broker closed the connection during the handshake; credentials may be wrong
    PossibleAuthenticationFailure { user: String },
    /// Asynchronous error on the connection's channel
    ChannelError(String),
    /// Connection closed normally
    Closed,
}

/// Receives [`LinkEvent`]s; may be invoked from threads outside the runtime
pub type LinkListener = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Errors raised by the broker client library
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("possible authentication failure for user {user}")]
    Authentication { user: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("publish was negatively acknowledged by the broker")]
    Nacked,
    #[error("channel is closed")]
    ChannelClosed,
}

impl BrokerError {
    /// Connection-establishment failures are answered with a reconnect
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::Connect(_) | BrokerError::Authentication { .. }
        )
    }
}

/// Opens a connection plus its single channel
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(
        &self,
        options: &ConnectionOptions,
        settings: ChannelSettings,
        role: ChannelRole,
        listener: LinkListener,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// One open connection and the channel it owns
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn role(&self) -> ChannelRole;

    fn is_open(&self) -> bool;

    async fn publish(
        &self,
        exchange_type: ExchangeType,
        exchange: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishInfo, BrokerError>;

    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueStats, BrokerError>;

    /// Declare `exchange` of the given type (if needed) and bind `queue` to it
    async fn bind_queue(
        &self,
        queue: &str,
        exchange_type: ExchangeType,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Attach `handler` as a consumer; returns the consumer tag
    async fn consume(
        &self,
        queue: &str,
        options: &SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Ask the broker to redeliver unacknowledged messages
    async fn recover(&self) -> Result<(), BrokerError>;

    async fn close(&self);
}
