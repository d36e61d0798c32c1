//! MQTT transport behaviour that does not need a running broker
//!
//! A broker that is down at startup must be reported as a connection
//! establishment failure, which the client treats as fatal.

use relaybus::config::{BusConfig, MqttSection, ReconnectConfig};
use relaybus::transport::mqtt::MqttTransport;
use relaybus::transport::{SubscribeOptions, Transport, TransportError, TransportEvent};
use relaybus::{BusClient, BusError, ConnectionState};
use std::time::Duration;
use tokio::time::timeout;

/// Nothing listens on port 1
const UNREACHABLE_BROKER: &str = "mqtt://127.0.0.1:1";

fn unreachable_config() -> MqttSection {
    MqttSection {
        broker_url: UNREACHABLE_BROKER.to_string(),
        ..MqttSection::default()
    }
}

#[tokio::test]
async fn test_invalid_broker_url_rejected() {
    let config = MqttSection {
        broker_url: "not a url".to_string(),
        ..MqttSection::default()
    };

    let result = MqttTransport::connect("bad-url", &config, ReconnectConfig::default()).await;
    assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
}

#[tokio::test]
async fn test_server_reports_endpoint() {
    let (transport, _events) =
        MqttTransport::connect("server-name", &unreachable_config(), ReconnectConfig::default())
            .await
            .unwrap();

    assert_eq!(transport.server(), "127.0.0.1:1");
    assert!(transport.new_inbox().starts_with("_INBOX/server-name/"));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_reply_inboxes_do_not_touch_the_broker() {
    let (transport, _events) =
        MqttTransport::connect("inbox-mux", &unreachable_config(), ReconnectConfig::default())
            .await
            .unwrap();

    let mut sids = Vec::new();
    for _ in 0..500 {
        let inbox = transport.new_inbox();
        sids.push(
            transport
                .subscribe(&inbox, SubscribeOptions::default())
                .await
                .unwrap(),
        );
    }
    for sid in sids {
        transport.unsubscribe(sid).await.unwrap();
    }
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_broker_down_at_startup_is_connection_failure() {
    let (_transport, mut events) =
        MqttTransport::connect("startup-down", &unreachable_config(), ReconnectConfig::default())
            .await
            .unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("transport should report the failed connection");

    match event {
        Some(TransportEvent::Error(err)) => {
            assert!(err.is_connection_failure());
            assert_eq!(err.code(), "CONN_ERR");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_client_closes_on_fatal_startup_failure() {
    let mut config = BusConfig::default().with_broker_url(UNREACHABLE_BROKER);
    config.client.exit_on_connection_failure = false;

    let client = BusClient::connect(config).await.unwrap();

    let ready = timeout(Duration::from_secs(5), client.connected())
        .await
        .expect("ready signal should resolve");
    assert!(matches!(ready, Err(BusError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
}
