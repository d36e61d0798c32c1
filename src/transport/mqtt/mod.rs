//! MQTT v5 transport
//!
//! Production [`Transport`](crate::transport::Transport) built on `rumqttc`,
//! split into focused sub-modules:
//!
//! - [`connection`] - Pure option building and topic naming
//! - [`message_handler`] - Pure event routing and the local subscription table
//! - [`link_monitor`] - Pure connect/reconnect bookkeeping
//! - [`client`] - Impure I/O operations and the event loop supervisor
//!
//! Bus concepts map onto MQTT v5 features:
//!
//! | Bus | MQTT v5 |
//! |---|---|
//! | subject | topic name (verbatim) |
//! | queue group | shared subscription `$share/<group>/<subject>` |
//! | reply address | `response_topic` publish property |
//! | reply inboxes | one `_INBOX/<client_id>/#` subscription per connection |
//! | subscription id | subscription identifier property (pooled, at most 268,435,455) |
//!
//! # Usage
//!
//! ```rust,no_run
//! use relaybus::config::{MqttSection, ReconnectConfig};
//! use relaybus::transport::mqtt::MqttTransport;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection::default();
//! let (transport, events) =
//!     MqttTransport::connect("my-client", &config, ReconnectConfig::default()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod link_monitor;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, BrokerEndpoint, TopicBuilder};
pub use link_monitor::{LinkMonitor, LinkPhase, LinkSignal};
pub use message_handler::{
    EventRoute, MessageHandler, SubscriptionTable, INBOX_BROKER_ID, MAX_BROKER_ID,
};
