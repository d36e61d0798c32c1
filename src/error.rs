//! Error types for bus client operations
//!
//! Transport and configuration layers keep their own error enums; both convert
//! into [`BusError`] at the client boundary.

use crate::config::ConfigError;
use crate::transport::{SubscriptionId, TransportError};
use thiserror::Error;

/// Message carried by every request timeout
pub const TIMEOUT_MESSAGE: &str = "response timeout";

/// Main error type for bus client operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("{message} (code: {code})")]
    ConnectionFatal { message: String, code: String },

    #[error("response timeout")]
    RequestTimeout { correlation_id: String },

    #[error("{message}")]
    RequestFailed {
        message: String,
        correlation_id: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("Client closed")]
    Closed,
}

impl BusError {
    /// Create a request timeout error
    pub fn request_timeout<S: Into<String>>(correlation_id: S) -> Self {
        Self::RequestTimeout {
            correlation_id: correlation_id.into(),
        }
    }

    /// Create a request failure error
    pub fn request_failed<M: Into<String>, C: Into<String>>(message: M, correlation_id: C) -> Self {
        Self::RequestFailed {
            message: message.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// Fatal connection error built from the transport failure
    pub fn connection_fatal(err: &TransportError) -> Self {
        Self::ConnectionFatal {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    /// Correlation id of a failed request
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            BusError::RequestTimeout { correlation_id }
            | BusError::RequestFailed { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::RequestTimeout { .. })
    }
}

/// Validate a subject before it reaches the transport
pub(crate) fn validate_subject(subject: &str) -> BusResult<()> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;
