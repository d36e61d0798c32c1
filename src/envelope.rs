//! Response envelope codec
//!
//! Replies to correlated requests travel as a two element JSON array,
//! `[error, result]`. A successful handler produces `[null, value]` and a
//! failed one `[{"message": ..., "stack": ...}, null]`. The decoder also
//! accepts the one element `[error]` form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Message used when a failure carries neither a message nor a detail
pub const DEFAULT_ERROR_MESSAGE: &str = "request error";

/// Error slot of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEnvelope {
    /// Handler succeeded; the value may be null
    Success(Value),
    /// Handler failed
    Failure(ErrorPayload),
}

/// Envelope decoding errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid response envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid response envelope: expected an array of one or two elements")]
    InvalidShape,
}

impl ResponseEnvelope {
    /// Envelope for a handler outcome
    pub fn from_outcome(outcome: Result<Value, HandlerError>) -> Self {
        match outcome {
            Ok(value) => ResponseEnvelope::Success(value),
            Err(err) => ResponseEnvelope::Failure(err.into_payload()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ResponseEnvelope::Success(value) => Value::Array(vec![Value::Null, value.clone()]),
            ResponseEnvelope::Failure(payload) => {
                let error = serde_json::to_value(payload).unwrap_or_else(|_| {
                    serde_json::json!({ "message": payload.message })
                });
                Value::Array(vec![error, Value::Null])
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let mut slots = match value {
            Value::Array(slots) if (1..=2).contains(&slots.len()) => slots,
            _ => return Err(EnvelopeError::InvalidShape),
        };

        let result = if slots.len() == 2 {
            slots.pop().unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        let error = slots.pop().unwrap_or(Value::Null);

        if error.is_null() {
            Ok(ResponseEnvelope::Success(result))
        } else {
            Ok(ResponseEnvelope::Failure(error_payload_from_value(&error)))
        }
    }
}

/// Read an error slot written by any peer
///
/// The message falls back to `detail`, then to [`DEFAULT_ERROR_MESSAGE`].
fn error_payload_from_value(error: &Value) -> ErrorPayload {
    let text = |key: &str| {
        error
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let message = match error {
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => text("message")
            .or_else(|| text("detail"))
            .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
    };

    ErrorPayload {
        message,
        stack: text("stack"),
    }
}

/// Failure returned by a listener handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerError {
    pub message: Option<String>,
    pub detail: Option<String>,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Failure described only by a detail string
    pub fn detail<S: Into<String>>(detail: S) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::default()
        }
    }

    pub fn with_stack<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Message that goes on the wire; never empty
    pub fn resolved_message(&self) -> String {
        [&self.message, &self.detail]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string())
    }

    pub fn into_payload(self) -> ErrorPayload {
        ErrorPayload {
            message: self.resolved_message(),
            stack: self.stack,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.resolved_message())
    }
}

impl std::error::Error for HandlerError {}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(err.to_string())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for HandlerError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        HandlerError::new(err.to_string())
    }
}
