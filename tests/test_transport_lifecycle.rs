//! Connect, readiness and close behavior of the transport
//!
//! Runs against the in-memory broker; paused-clock tests drive the connect
//! timeout without waiting in real time.


use amqp_transport::testing::{MockBroker, MockResolver};
use amqp_transport::transport::amqp::{ChannelRole, ConnectionOptions, Readiness};
use std::net::IpAddr;
use std::time::Duration;
use test_helpers::{
    connected_transport, pool, settle, transport_with, transport_with_resolver, HookRecorder,
};

#[tokio::test]
async fn test_ready_once_both_connections_open() {
    // Arrange
    let broker = MockBroker::new();
    let transport = transport_with(&broker);

    // Act
    transport.connect(pool(&["10.0.0.1"]));
    transport.ready().await.expect("transport should become ready");

    // Assert
    assert!(transport.is_connected());
    assert!(matches!(transport.readiness(), Readiness::Ready(_)));

    let open = broker.open_sessions();
    assert_eq!(open.len(), 2);
    assert!(open.iter().any(|s| s.role == ChannelRole::Primary));
    assert!(open.iter().any(|s| s.role == ChannelRole::Secondary));
    assert!(open
        .iter()
        .all(|s| s.options.host.as_deref() == Some("10.0.0.1")));
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_while_secondary_is_pending() {
    // Arrange
    let broker = MockBroker::new();
    broker.stall_role(ChannelRole::Secondary);
    let transport = transport_with(&broker);

    // Act
    transport.connect(pool(&["10.0.0.1"]));
    let waited = tokio::time::timeout(Duration::from_secs(10), transport.ready()).await;

    // Assert: primary alone never counts as connected
    assert!(waited.is_err(), "ready must not fire with one connection open");
    assert!(!transport.is_connected());
    assert_eq!(transport.readiness(), Readiness::Pending);
    assert_eq!(broker.open_sessions().len(), 1);

    // Act: secondary completes within the same cycle
    broker.heal();
    transport.ready().await.expect("transport should become ready");

    // Assert
    assert!(transport.is_connected());
    assert_eq!(broker.primary_attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_forces_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    broker.stall_role(ChannelRole::Secondary);
    let transport = transport_with(&broker);
    let hooks = HookRecorder::attach(&transport);

    // Act
    transport.connect(pool(&["10.0.0.1"]));
    tokio::time::sleep(Duration::from_secs(19)).await;

    // Assert: nothing happens before the timeout
    assert_eq!(hooks.before_count(), 0);
    assert!(!transport.is_reconnecting());

    // Act
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Assert
    assert_eq!(hooks.before_count(), 1);
    assert!(transport.is_reconnecting());
    assert!(!transport.is_connected());

    // Act: the stalled attempt finishes late; the scheduler tick connects
    broker.heal();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Assert
    assert!(transport.is_connected());
    assert!(!transport.is_reconnecting());
    assert_eq!(hooks.after_count(), 1);
    assert_eq!(broker.primary_attempts().len(), 2);
    assert_eq!(broker.open_sessions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_does_not_fire_after_connecting() {
    // Arrange
    let broker = MockBroker::new();
    let transport = connected_transport(&broker).await;
    let hooks = HookRecorder::attach(&transport);

    // Act
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    assert!(transport.is_connected());
    assert_eq!(hooks.before_count(), 0);
    assert_eq!(broker.primary_attempts().len(), 1);
}

#[tokio::test]
async fn test_empty_pool_uses_default_options() {
    // Arrange
    let broker = MockBroker::new();
    let transport = transport_with(&broker);

    // Act
    transport.connect(Vec::new());
    transport.ready().await.expect("transport should become ready");

    // Assert
    let attempts = broker.attempts();
    assert_eq!(attempts.len(), 2);
    for attempt in attempts {
        assert_eq!(attempt.options, ConnectionOptions::default());
        assert_eq!(attempt.options.host(), "127.0.0.1");
        assert_eq!(attempt.options.port(), 5672);
    }
}

#[tokio::test]
async fn test_prefetch_applied_to_both_channels() {
    // Arrange
    let broker = MockBroker::new();
    let transport = transport_with(&broker);
    let options = ConnectionOptions {
        prefetch: Some(10),
        ..ConnectionOptions::for_host("10.0.0.1")
    };

    // Act
    transport.connect(vec![options]);
    transport.ready().await.expect("transport should become ready");

    // Assert
    let sessions = broker.open_sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.settings.prefetch == 10));
    assert!(sessions.iter().all(|s| s.settings.auto_recovery));
}

#[tokio::test]
async fn test_missing_or_invalid_prefetch_defaults_to_one() {
    for prefetch in [None, Some(0), Some(-5)] {
        // Arrange
        let broker = MockBroker::new();
        let transport = transport_with(&broker);
        let options = ConnectionOptions {
            prefetch,
            ..ConnectionOptions::for_host("10.0.0.1")
        };

        // Act
        transport.connect(vec![options]);
        transport.ready().await.expect("transport should become ready");

        // Assert
        assert!(
            broker.open_sessions().iter().all(|s| s.settings.prefetch == 1),
            "prefetch {prefetch:?} should fall back to 1"
        );
    }
}

#[tokio::test]
async fn test_hostname_is_resolved_before_connecting() {
    // Arrange
    let broker = MockBroker::new();
    let address: IpAddr = "10.0.0.7".parse().unwrap();
    let resolver = MockResolver::new().with_host("rabbit.internal", address);
    let transport = transport_with_resolver(&broker, resolver.clone());

    // Act
    transport.connect(pool(&["rabbit.internal"]));
    transport.ready().await.expect("transport should become ready");

    // Assert
    assert_eq!(resolver.lookups(), vec!["rabbit.internal".to_string()]);
    assert!(broker
        .attempts()
        .iter()
        .all(|a| a.options.host.as_deref() == Some("10.0.0.7")));
}

#[tokio::test]
async fn test_ip_literal_skips_resolution() {
    // Arrange
    let broker = MockBroker::new();
    let resolver = MockResolver::new();
    let transport = transport_with_resolver(&broker, resolver.clone());

    // Act
    transport.connect(pool(&["10.0.0.1"]));
    transport.ready().await.expect("transport should become ready");

    // Assert
    assert!(resolver.lookups().is_empty());
}

#[tokio::test]
async fn test_resolution_failure_triggers_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    let transport = transport_with_resolver(&broker, MockResolver::new());
    let hooks = HookRecorder::attach(&transport);

    // Act
    transport.connect(pool(&["missing.internal"]));
    settle().await;

    // Assert
    assert!(transport.is_reconnecting());
    assert_eq!(hooks.before_count(), 1);
    assert_eq!(broker.attempt_count(), 0);
    assert!(hooks.errors().is_empty(), "connectivity failures are not reported");
}

#[tokio::test]
async fn test_rejected_credentials_trigger_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    broker.reject_credentials();
    let transport = transport_with(&broker);
    let hooks = HookRecorder::attach(&transport);

    // Act
    transport.connect(pool(&["10.0.0.1"]));
    settle().await;

    // Assert
    assert!(!transport.is_connected());
    assert!(transport.is_reconnecting());
    assert_eq!(hooks.before_count(), 1);
    assert_eq!(broker.attempt_count(), 2);
    assert!(hooks.errors().is_empty());
}

#[tokio::test]
async fn test_close_when_connected() {
    // Arrange
    let broker = MockBroker::new();
    let transport = connected_transport(&broker).await;
    let hooks = HookRecorder::attach(&transport);

    // Act
    transport.close();

    // Assert: the pair is torn down immediately
    assert!(!transport.is_connected());
    assert_eq!(transport.readiness(), Readiness::Pending);

    settle().await;
    assert!(broker.open_sessions().is_empty());

    // Act: a closed transport ignores reconnect requests
    transport.reconnect(true);

    // Assert
    assert!(!transport.is_reconnecting());
    assert_eq!(hooks.before_count(), 0);
}

#[tokio::test]
async fn test_close_while_connecting_discards_late_connections() {
    // Arrange
    let broker = MockBroker::new();
    broker.stall_role(ChannelRole::Secondary);
    let transport = transport_with(&broker);
    transport.connect(pool(&["10.0.0.1"]));
    settle().await;

    // Act
    transport.close();
    settle().await;
    broker.heal();
    settle().await;

    // Assert
    assert!(!transport.is_connected());
    assert_eq!(transport.readiness(), Readiness::Pending);
    assert_eq!(broker.sessions().len(), 2);
    assert!(broker.open_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_right_after_deferred_close_keeps_new_connections() {
    // Arrange
    let broker = MockBroker::new();
    let transport = transport_with(&broker);

    // Act
    transport.close();
    transport.connect(pool(&["10.0.0.1"]));
    transport.ready().await.expect("transport should become ready");
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    assert!(transport.is_connected());
    assert!(matches!(transport.readiness(), Readiness::Ready(_)));
    assert_eq!(broker.open_sessions().len(), 2);
    assert_eq!(broker.primary_attempts().len(), 1);
}

#[tokio::test]
async fn test_connect_after_close() {
    // Arrange
    let broker = MockBroker::new();
    let transport = connected_transport(&broker).await;
    transport.close();

    // Act
    transport.connect(pool(&["10.0.0.2"]));
    transport.ready().await.expect("transport should become ready again");

    // Assert
    assert!(transport.is_connected());
    settle().await;
    let open = broker.open_sessions();
    assert_eq!(open.len(), 2);
    assert!(open
        .iter()
        .all(|s| s.options.host.as_deref() == Some("10.0.0.2")));
}

#[tokio::test]
async fn test_connect_again_replaces_connections() {
    // Arrange
    let broker = MockBroker::new();
    let transport = connected_transport(&broker).await;

    // Act
    transport.connect(pool(&["10.0.0.3"]));
    transport.ready().await.expect("transport should become ready");
    settle().await;

    // Assert
    assert_eq!(broker.sessions().len(), 4);
    let open = broker.open_sessions();
    assert_eq!(open.len(), 2);
    assert!(open
        .iter()
        .all(|s| s.options.host.as_deref() == Some("10.0.0.3")));
}

#[tokio::test]
async fn test_clones_share_connection_state() {
    // Arrange
    let broker = MockBroker::new();
    let transport = connected_transport(&broker).await;

    // Act
    let clone = transport.clone();
    clone.close();

    // Assert
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_health_reports_connected_pair() {
    // Arrange
    let broker = MockBroker::new();
    let transport = transport_with(&broker);
    assert!(!transport.health().is_healthy);

    // Act
    transport.connect(pool(&["10.0.0.1"]));
    transport.ready().await.expect("transport should become ready");

    // Assert
    let health = transport.health();
    assert!(health.connected);
    assert!(health.is_healthy);
    assert!(!health.reconnecting);
    assert_eq!(health.reconnect_count, 0);
    assert!(health.uptime.is_some());
}
