//! Transport layer for the monitoring event bus
//!
//! This module defines the transport abstraction shared by every backend and
//! the AMQP implementation.

use crate::error::TransportError;
use amqp::{
    ConnectionOptions, DeliveryHandler, DeliveryInfo, ExchangeType, PublishInfo, PublishOptions,
    QueueOptions, QueueStats, SubscribeOptions,
};
use std::sync::Arc;

pub mod amqp;

/// Invoked at a reconnection boundary
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Receives every error the transport reports instead of raising
pub type ErrorHook = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Transport trait for event bus communication
///
/// Operations that a backend does not override are no-ops, or report
/// [`TransportError::Unsupported`] when they must return a value.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting to one of the candidate brokers
    fn connect(&self, pool: Vec<ConnectionOptions>);

    fn reconnect(&self, _force: bool) {}

    fn is_connected(&self) -> bool {
        false
    }

    fn close(&self) {}

    /// Resolves once the transport is fully connected
    async fn ready(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            operation: "ready".to_string(),
        })
    }

    async fn publish(
        &self,
        _exchange_type: ExchangeType,
        _pipe: &str,
        _message: &[u8],
        _options: &PublishOptions,
    ) -> Result<PublishInfo, TransportError> {
        Err(TransportError::Unsupported {
            operation: "publish".to_string(),
        })
    }

    async fn subscribe(
        &self,
        _exchange_type: ExchangeType,
        _pipe: &str,
        _funnel: &str,
        _options: &SubscribeOptions,
        _handler: Arc<dyn DeliveryHandler>,
    ) {
    }

    async fn unsubscribe(&self) {}

    async fn acknowledge(&self, _info: &DeliveryInfo) {}

    async fn stats(
        &self,
        _funnel: &str,
        _options: &QueueOptions,
    ) -> Result<QueueStats, TransportError> {
        Err(TransportError::Unsupported {
            operation: "stats".to_string(),
        })
    }

    fn set_before_reconnect(&self, hook: LifecycleHook);

    fn set_after_reconnect(&self, hook: LifecycleHook);

    fn set_on_error(&self, hook: ErrorHook);
}

/// Type alias for the AMQP transport
pub type RabbitMqTransport = amqp::AmqpTransport;
