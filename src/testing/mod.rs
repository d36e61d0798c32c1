//! Testing utilities
//!
//! An in-memory broker for exercising clients without an MQTT server.

pub mod mocks;

pub use mocks::*;
