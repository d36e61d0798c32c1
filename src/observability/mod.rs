//! Observability: structured logging and log redaction

pub mod logging;
pub mod redaction;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use redaction::{screen_payload, screen_text};

// Span macros for structured logging
pub use logging::{bus_span, lifecycle_span};
