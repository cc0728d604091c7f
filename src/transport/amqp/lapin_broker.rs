//! Broker seam implemented on the `lapin` AMQP 0-9-1 client
//!
//! Each [`LapinSession`] owns one TCP connection and exactly one channel.
//! Connection and channel error callbacks are translated into [`LinkEvent`]s.

use super::broker::{
    BrokerConnector, BrokerError, BrokerSession, DeliveryHandler, DeliveryInfo, ExchangeType,
    LinkEvent, LinkListener, PublishInfo, PublishOptions, QueueOptions, QueueStats,
    SubscribeOptions,
};
use super::connection::{ChannelRole, ChannelSettings};
use super::options::ConnectionOptions;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRecoverOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opens lapin connections
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn open(
        &self,
        options: &ConnectionOptions,
        settings: ChannelSettings,
        role: ChannelRole,
        listener: LinkListener,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let uri = options
            .to_amqp_uri()
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let user = options.user().to_string();

        debug!(channel = %role, endpoint = %options.endpoint(), "Opening broker connection");

        let properties = ConnectionProperties::default()
            .with_connection_name(format!("amqp-transport-{role}").into());
        let connection = Connection::connect(&uri, properties)
            .await
            .map_err(|e| classify_connect_error(&e, &user))?;

        let connection_listener = listener.clone();
        let connection_user = user.clone();
        connection.on_error(move |error| {
            connection_listener(classify_link_error(&error, &connection_user));
        });

        let channel_failed = Arc::new(AtomicBool::new(false));
        let channel = match setup_channel(
            &connection,
            settings,
            Arc::clone(&channel_failed),
            listener,
        )
        .await
        {
            Ok(channel) => channel,
            Err(error) => {
                if let Err(close_error) = connection.close(200, "channel setup failed").await {
                    debug!(channel = %role, error = %close_error, "Error while closing connection");
                }
                return Err(error);
            }
        };

        info!(
            channel = %role,
            endpoint = %options.endpoint(),
            vhost = %options.vhost(),
            prefetch = settings.prefetch,
            "Broker connection open"
        );

        Ok(Arc::new(LapinSession {
            role,
            connection,
            channel,
            channel_failed,
            declared_exchanges: Mutex::new(HashSet::new()),
            consumers: Mutex::new(HashMap::new()),
        }))
    }
}

/// Create the connection's channel, apply prefetch and hook channel errors
///
/// `channel_failed` is raised before the listener runs so the session
/// already reports closed when the transport reacts to the error.
async fn setup_channel(
    connection: &Connection,
    settings: ChannelSettings,
    channel_failed: Arc<AtomicBool>,
    listener: LinkListener,
) -> Result<Channel, BrokerError> {
    let channel = connection.create_channel().await.map_err(protocol)?;

    channel
        .basic_qos(settings.prefetch, BasicQosOptions { global: false })
        .await
        .map_err(protocol)?;

    // lapin has no channel-level auto-recovery; a failed channel marks the
    // pair broken and the transport rebuilds it with a reconnect.
    if settings.auto_recovery {
        debug!("Channel recovery delegated to the reconnect scheduler");
    }

    channel.on_error(move |error| {
        channel_failed.store(true, Ordering::Release);
        listener(LinkEvent::ChannelError(error.to_string()));
    });

    Ok(channel)
}

fn protocol(error: lapin::Error) -> BrokerError {
    BrokerError::Protocol(error.to_string())
}

/// True if broker error text suggests rejected credentials
pub fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("access_refused")
        || lower.contains("access-refused")
        || lower.contains("login was refused")
        || lower.contains("authentication")
}

fn classify_connect_error(error: &lapin::Error, user: &str) -> BrokerError {
    let message = error.to_string();
    if looks_like_auth_failure(&message) {
        BrokerError::Authentication {
            user: user.to_string(),
        }
    } else {
        BrokerError::Connect(message)
    }
}

fn classify_link_error(error: &lapin::Error, user: &str) -> LinkEvent {
    match error {
        lapin::Error::MissingHeartbeatError => LinkEvent::HeartbeatMissed,
        lapin::Error::IOError(io_error) => LinkEvent::Lost(io_error.to_string()),
        other => {
            let message = other.to_string();
            if looks_like_auth_failure(&message) {
                LinkEvent::PossibleAuthenticationFailure {
                    user: user.to_string(),
                }
            } else {
                LinkEvent::Lost(message)
            }
        }
    }
}

fn exchange_kind(exchange_type: ExchangeType) -> ExchangeKind {
    match exchange_type {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
    }
}

/// One lapin connection and its channel
pub struct LapinSession {
    role: ChannelRole,
    connection: Connection,
    channel: Channel,
    channel_failed: Arc<AtomicBool>,
    declared_exchanges: Mutex<HashSet<(ExchangeType, String)>>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LapinSession {
    async fn ensure_exchange(
        &self,
        exchange_type: ExchangeType,
        exchange: &str,
    ) -> Result<(), BrokerError> {
        // The nameless default exchange always exists and cannot be declared
        if exchange.is_empty() {
            return Ok(());
        }

        let key = (exchange_type, exchange.to_string());
        if self.declared_exchanges.lock().contains(&key) {
            return Ok(());
        }

        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(exchange_type),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;

        self.declared_exchanges.lock().insert(key);
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for LapinSession {
    fn role(&self) -> ChannelRole {
        self.role
    }

    fn is_open(&self) -> bool {
        !self.channel_failed.load(Ordering::Acquire)
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn publish(
        &self,
        exchange_type: ExchangeType,
        exchange: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishInfo, BrokerError> {
        self.ensure_exchange(exchange_type, exchange).await?;

        let mut properties = BasicProperties::default();
        if options.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(content_type) = &options.content_type {
            properties = properties.with_content_type(content_type.clone().into());
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                &options.routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(protocol)?
            .await
            .map_err(protocol)?;

        if confirmation.is_nack() {
            return Err(BrokerError::Nacked);
        }

        Ok(PublishInfo {
            exchange: exchange.to_string(),
            exchange_type,
            routing_key: options.routing_key.clone(),
            channel: self.role,
            acked: confirmation.is_ack(),
        })
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueStats, BrokerError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    auto_delete: options.auto_delete,
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;

        Ok(QueueStats {
            messages: declared.message_count(),
            consumers: declared.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange_type: ExchangeType,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_exchange(exchange_type, exchange).await?;

        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn consume(
        &self,
        queue: &str,
        options: &SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, BrokerError> {
        let consumer_tag = format!("{queue}-{}", uuid::Uuid::new_v4());

        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: !options.ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;

        let role = self.role;
        let tag = consumer_tag.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let info = DeliveryInfo {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            redelivered: delivery.redelivered,
                            consumer_tag: tag.clone(),
                            channel: role,
                            cycle: 0,
                        };
                        handler.handle(info, delivery.data).await;
                    }
                    Err(error) => {
                        warn!(consumer_tag = %tag, error = %error, "Consumer delivery error");
                        break;
                    }
                }
            }
            debug!(consumer_tag = %tag, "Consumer stream ended");
        });

        self.consumers.lock().insert(consumer_tag.clone(), handle);
        Ok(consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(protocol)?;
        self.consumers.lock().remove(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(protocol)
    }

    async fn recover(&self) -> Result<(), BrokerError> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await
            .map_err(protocol)
    }

    async fn close(&self) {
        for (_, handle) in self.consumers.lock().drain() {
            handle.abort();
        }

        if self.connection.status().connected() {
            if let Err(error) = self.connection.close(200, "transport closing").await {
                debug!(channel = %self.role, error = %error, "Error while closing connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_detection() {
        assert!(looks_like_auth_failure(
            "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN"
        ));
        assert!(looks_like_auth_failure("access-refused"));
        assert!(!looks_like_auth_failure("Connection refused (os error 111)"));
        assert!(!looks_like_auth_failure("NOT_FOUND - no queue 'results'"));
    }

    #[test]
    fn test_exchange_kind_mapping() {
        assert_eq!(exchange_kind(ExchangeType::Direct), ExchangeKind::Direct);
        assert_eq!(exchange_kind(ExchangeType::Fanout), ExchangeKind::Fanout);
        assert_eq!(exchange_kind(ExchangeType::Topic), ExchangeKind::Topic);
    }

    #[test]
    fn test_heartbeat_error_maps_to_heartbeat_missed() {
        let event = classify_link_error(&lapin::Error::MissingHeartbeatError, "sensu");
        assert_eq!(event, LinkEvent::HeartbeatMissed);
    }
}
