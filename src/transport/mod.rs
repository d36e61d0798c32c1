//! Transport layer for bus communication
//!
//! This module provides the transport abstraction consumed by the client core
//! and the MQTT implementation used in production.
//!
//! A transport is split in two halves at connect time: an object implementing
//! [`Transport`] for outbound operations, and a [`TransportEvents`] stream that
//! carries lifecycle events and inbound messages back to the client.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Opaque handle for a transport-level subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options for a subscribe call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group; among subscribers sharing a group only one receives each message
    pub queue: Option<String>,
}

impl SubscribeOptions {
    pub fn queue<S: Into<String>>(group: S) -> Self {
        Self {
            queue: Some(group.into()),
        }
    }
}

/// A message delivered to one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sid: SubscriptionId,
    pub subject: String,
    pub payload: Bytes,
    pub reply_to: Option<String>,
}

/// Events emitted by a connected transport
#[derive(Debug)]
pub enum TransportEvent {
    /// First successful connection
    Connect,
    /// Connection lost
    Disconnect,
    /// Attempting to re-establish the connection
    Reconnecting,
    /// Connection re-established after a disconnect
    Reconnect,
    /// Transport level failure
    Error(TransportError),
    /// Message delivered to a subscription
    Message(InboundMessage),
}

/// Receiving half handed out by a transport at connect time
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half kept by a transport implementation
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection error: {0}")]
    ConnectionLost(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unsubscribe failed")]
    UnsubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Error code reported alongside the message in logs
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::ConnectionFailed(_) => "CONN_ERR",
            TransportError::ConnectionLost(_) => "CONN_LOST",
            TransportError::PublishFailed(_) => "PUB_ERR",
            TransportError::SubscriptionFailed(_) => "SUB_ERR",
            TransportError::UnsubscribeFailed(_) => "UNSUB_ERR",
            TransportError::InvalidBrokerUrl(_) => "BAD_URL",
            TransportError::Closed => "CLOSED",
        }
    }

    /// Whether the error means the connection could not be established at all
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, TransportError::ConnectionFailed(_))
    }
}

/// Pub/sub transport capability
///
/// Implementations deliver inbound traffic and lifecycle changes through the
/// [`TransportEvents`] stream returned when they are created. All methods must
/// be callable concurrently from any task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload, optionally asking for replies on `reply_to`
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Start delivery for `subject`
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, TransportError>;

    /// Stop delivery for a subscription
    async fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError>;

    /// Generate a subject unique to this connection, suitable as a reply address
    fn new_inbox(&self) -> String;

    /// Human readable address of the server this transport talks to
    fn server(&self) -> String;

    /// Shut the connection down; the event stream ends afterwards
    async fn close(&self) -> Result<(), TransportError>;
}
