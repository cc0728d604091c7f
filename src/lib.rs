//! Resilient AMQP transport for a monitoring event bus
//!
//! Publishes events, consumes work queues, acknowledges deliveries and reports
//! queue depth over RabbitMQ, riding out broker loss with failover across a
//! pool of brokers and a capped reconnect cadence.
//!
//! # Overview
//!
//! - Two physical connections per broker: keepalive traffic on the primary,
//!   everything else on the secondary
//! - Randomized failover across candidate brokers
//! - Reconnect scheduler with a re-entrancy guard
//! - Idempotent subscriptions
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use amqp_transport::transport::amqp::{AmqpTransport, ConnectionOptions, ExchangeType, PublishOptions};
//!
//! # tokio_test::block_on(async {
//! let transport = AmqpTransport::new()?;
//! transport.on_before_reconnect(|| println!("reconnecting"));
//! transport.connect(vec![
//!     ConnectionOptions::for_host("10.0.0.5"),
//!     ConnectionOptions::for_host("10.0.0.6"),
//! ]);
//! transport.ready().await?;
//!
//! let keepalive = br#"{"client":"web-01"}"#;
//! transport
//!     .publish(ExchangeType::Direct, "keepalives", keepalive, &PublishOptions::default())
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, TransportConfig};
pub use error::{ErrorCode, ErrorInfo, TransportError, TransportResult};
pub use transport::amqp::AmqpTransport;
pub use transport::Transport;
