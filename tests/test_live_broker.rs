//! End-to-end tests against a real RabbitMQ
//!
//! Ignored by default. Run with a broker listening on `AMQP_HOST`:
//!
//! ```bash
//! docker run -d -p 5672:5672 rabbitmq:3
//! AMQP_HOST=127.0.0.1 cargo test --test test_live_broker -- --ignored
//! ```

use amqp_transport::transport::amqp::{
    AmqpTransport, ConnectionOptions, DeliveryInfo, ExchangeType, PublishOptions, QueueOptions,
    SubscribeOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn live_pool() -> Vec<ConnectionOptions> {
    let host = std::env::var("AMQP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    vec![ConnectionOptions::for_host(host)]
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ"]
async fn test_round_trip_through_live_broker() {
    // Arrange
    let transport = AmqpTransport::new().expect("transport should build");
    transport.connect(live_pool());
    tokio::time::timeout(Duration::from_secs(20), transport.ready())
        .await
        .expect("broker should accept connections")
        .expect("transport should become ready");

    let funnel = format!("live-{}", uuid::Uuid::new_v4());
    let (tx, mut rx) = mpsc::unbounded_channel::<(DeliveryInfo, Vec<u8>)>();
    transport
        .subscribe(
            ExchangeType::Direct,
            &funnel,
            &funnel,
            &SubscribeOptions::default(),
            Arc::new(tx),
        )
        .await;

    // Act
    transport
        .publish(ExchangeType::Direct, &funnel, b"{\"status\":0}", &PublishOptions::default())
        .await
        .expect("publish should succeed");
    let (info, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery should arrive")
        .expect("channel should stay open");
    transport.acknowledge(&info).await;

    // Assert
    assert_eq!(payload, b"{\"status\":0}");
    let stats = transport
        .stats(&funnel, &QueueOptions::default())
        .await
        .expect("stats should succeed");
    assert_eq!(stats.consumers, 1);

    transport.unsubscribe().await;
    transport.close();
}
