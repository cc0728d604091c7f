//! Resilient AMQP transport for the monitoring event bus
//!
//! The transport keeps two physical connections to one broker: the primary
//! carries keepalive traffic only, the secondary everything else, so that bulk
//! backpressure never delays liveness reports. Connection loss of any kind is
//! answered with a reconnect on a capped, incrementing cadence against a
//! shuffled pool of brokers.
//!
//! # Architecture
//!
//! - [`broker`] - Seam over the broker client library
//! - [`lapin_broker`] - Production broker seam on top of `lapin`
//! - [`options`] - Connection options, failover selection and host resolution
//! - [`connection`] - Pure channel role and link event decisions
//! - [`reconnect`] - Retry cadence and the re-entrancy guard
//! - [`subscriptions`] - Funnel tracking for idempotent subscribe
//! - [`health`] - Pure connection health metrics
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use amqp_transport::transport::amqp::{
//!     AmqpTransport, ConnectionOptions, ExchangeType, PublishOptions,
//! };
//!
//! # tokio_test::block_on(async {
//! let transport = AmqpTransport::new()?;
//! transport.on_error(|error| eprintln!("transport error: {error}"));
//!
//! transport.connect(vec![ConnectionOptions::for_host("10.0.0.5")]);
//! transport.ready().await?;
//!
//! transport
//!     .publish(ExchangeType::Direct, "results", b"{}", &PublishOptions::default())
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod broker;
pub mod client;
pub mod connection;
pub mod health;
pub mod lapin_broker;
pub mod options;
pub mod reconnect;
pub mod subscriptions;

// Re-export public types for convenience
pub use broker::{
    BrokerConnector, BrokerError, BrokerSession, DeliveryHandler, DeliveryInfo, ExchangeType,
    LinkEvent, LinkListener, PublishInfo, PublishOptions, QueueOptions, QueueStats,
    SubscribeOptions,
};
pub use client::{AmqpTransport, Readiness};
pub use connection::{ChannelRole, ChannelSettings, ConnectionState, LinkAction, KEEPALIVE_PIPE};
pub use health::{ConnectionQuality, HealthMetrics};
pub use lapin_broker::{LapinConnector, LapinSession};
pub use options::{BrokerOptionSelector, ConnectionOptions, DnsResolver, HostResolver};
pub use reconnect::{ReconnectGuard, ReconnectPolicy};
pub use subscriptions::{SubscriptionRegistry, TrackedConsumer};
