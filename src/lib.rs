//! relaybus - request/reply and work distribution over a pub/sub bus
//!
//! A client-side layer over a publish/subscribe transport that offers four
//! interaction patterns on one long-lived connection:
//!
//! - broadcast: every subscriber receives every message ([`BusClient::subscribe`])
//! - queue work: one worker per group receives each message ([`BusClient::process`])
//! - request/reply: one listener answers each request ([`BusClient::listen`], [`BusClient::request`])
//! - one-shot: a handler that runs for the first message only ([`BusClient::subscribe_once`])
//!
//! The production transport speaks MQTT v5 ([`transport::mqtt`]); tests use the
//! in-process [`testing::MemoryBroker`].
//!
//! # Quick Start
//!
//! ```rust
//! use relaybus::testing::MemoryBroker;
//! use relaybus::{BusClient, BusConfig, TridIdentity};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let (transport, events) = broker.connect();
//! let client = BusClient::with_transport(
//!     BusConfig::default(),
//!     Arc::new(TridIdentity::new("default")),
//!     Arc::new(transport),
//!     events,
//! )?;
//! client.connected().await?;
//!
//! client
//!     .listen("greet", |message: Value| async move {
//!         Ok(json!(format!("hello {}", message["name"].as_str().unwrap_or("?"))))
//!     })
//!     .await?;
//!
//! let greeting: String = client.request("greet", &json!({"name": "bus"})).await?;
//! assert_eq!(greeting, "hello bus");
//! # Ok::<(), relaybus::BusError>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod observability;
pub mod registry;
pub mod testing;
pub mod transport;

pub use client::BusClient;
pub use config::{BusConfig, ConfigError};
pub use connection::{ConnectionState, StateChange};
pub use envelope::{HandlerError, ResponseEnvelope};
pub use error::{BusError, BusResult};
pub use identity::{IdentityProvider, TridIdentity};
pub use transport::{SubscriptionId, Transport, TransportError};
