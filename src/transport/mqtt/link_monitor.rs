//! Pure link tracking for the MQTT event loop
//!
//! Decides which lifecycle events a broker acknowledgement or a connection
//! error translates into, and how long to wait before polling again.

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Where the link currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No connection has been acknowledged yet
    NeverConnected,
    /// Connected
    Up,
    /// Lost after having been up
    Down,
}

/// Lifecycle signal to forward to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Connect,
    Disconnect,
    Reconnecting,
    Reconnect,
    /// The initial connection could not be established
    ConnectionFailed,
}

/// Tracks link phase and reconnection attempts
#[derive(Debug)]
pub struct LinkMonitor {
    phase: LinkPhase,
    attempts: u32,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self {
            phase: LinkPhase::NeverConnected,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Broker acknowledged the connection
    pub fn on_connack(&mut self) -> LinkSignal {
        let signal = match self.phase {
            LinkPhase::NeverConnected => LinkSignal::Connect,
            LinkPhase::Up | LinkPhase::Down => LinkSignal::Reconnect,
        };
        self.phase = LinkPhase::Up;
        self.attempts = 0;
        signal
    }

    /// Broker sent DISCONNECT
    pub fn on_broker_disconnect(&mut self) -> Vec<LinkSignal> {
        match self.phase {
            LinkPhase::Up => {
                self.phase = LinkPhase::Down;
                vec![LinkSignal::Disconnect]
            }
            LinkPhase::NeverConnected | LinkPhase::Down => Vec::new(),
        }
    }

    /// Polling the event loop failed
    pub fn on_connection_error(&mut self) -> Vec<LinkSignal> {
        match self.phase {
            LinkPhase::NeverConnected => vec![LinkSignal::ConnectionFailed],
            LinkPhase::Up => {
                self.phase = LinkPhase::Down;
                self.attempts = 1;
                vec![LinkSignal::Disconnect, LinkSignal::Reconnecting]
            }
            LinkPhase::Down => {
                self.attempts += 1;
                vec![LinkSignal::Reconnecting]
            }
        }
    }

    /// Delay before the next reconnection attempt
    pub fn next_delay(&self, config: &ReconnectConfig) -> Duration {
        config.calculate_backoff_delay(self.attempts.max(1))
    }
}
