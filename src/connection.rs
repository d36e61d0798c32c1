//! Connection lifecycle state machine
//!
//! Tracks the client's view of the transport connection. Transport lifecycle
//! events are the only input; consumers observe the result through the current
//! value, a `watch` channel, a broadcast stream of transitions and a one-shot
//! ready signal that fires the first time the client reaches `Connected`.

use crate::error::{BusError, BusResult};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};

/// Capacity of the transition broadcast channel
const CHANGES_CAPACITY: usize = 64;

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Terminal; entered on close or a fatal connection error
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connect,
    Disconnect,
    Reconnecting,
    Reconnect,
    Close,
}

/// One state change as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Result of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Disconnect from a live connection; the only disconnect worth reporting
    pub report_disconnect: bool,
    /// This transition fired the ready signal
    pub became_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadySignal {
    Pending,
    Ready,
    Abandoned,
}

#[derive(Debug)]
struct MachineState {
    state: ConnectionState,
    ready_fired: bool,
}

/// Connection lifecycle tracker
#[derive(Debug)]
pub struct ConnectionStateMachine {
    inner: Mutex<MachineState>,
    state_tx: watch::Sender<ConnectionState>,
    ready_tx: watch::Sender<ReadySignal>,
    changes_tx: broadcast::Sender<StateChange>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (ready_tx, _) = watch::channel(ReadySignal::Pending);
        let (changes_tx, _) = broadcast::channel(CHANGES_CAPACITY);

        Self {
            inner: Mutex::new(MachineState {
                state: ConnectionState::Connecting,
                ready_fired: false,
            }),
            state_tx,
            ready_tx,
            changes_tx,
        }
    }

    /// Pure transition function
    pub fn next_state(current: ConnectionState, event: LifecycleEvent) -> ConnectionState {
        if current == ConnectionState::Closed {
            return ConnectionState::Closed;
        }
        match event {
            LifecycleEvent::Connect | LifecycleEvent::Reconnect => ConnectionState::Connected,
            LifecycleEvent::Disconnect => ConnectionState::Disconnected,
            LifecycleEvent::Reconnecting => ConnectionState::Reconnecting,
            LifecycleEvent::Close => ConnectionState::Closed,
        }
    }

    /// Apply an event; returns `None` once the machine is closed
    pub fn apply(&self, event: LifecycleEvent) -> Option<Transition> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let from = inner.state;
        if from == ConnectionState::Closed {
            return None;
        }

        let to = Self::next_state(from, event);
        let became_ready = to == ConnectionState::Connected && !inner.ready_fired;
        let transition = Transition {
            from,
            to,
            report_disconnect: event == LifecycleEvent::Disconnect
                && from == ConnectionState::Connected,
            became_ready,
        };

        inner.state = to;
        if became_ready {
            inner.ready_fired = true;
            self.ready_tx.send_replace(ReadySignal::Ready);
        } else if to == ConnectionState::Closed && !inner.ready_fired {
            self.ready_tx.send_replace(ReadySignal::Abandoned);
        }

        self.state_tx.send_replace(to);
        if from != to {
            // No subscribers is fine
            let _ = self.changes_tx.send(StateChange { from, to });
        }

        Some(transition)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Current state plus change notification
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Stream of every state change from now on
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes_tx.subscribe()
    }

    /// Completes once the first connection is established
    ///
    /// Completes immediately for callers arriving after that point. Fails
    /// with [`BusError::Closed`] if the machine closes before ever connecting.
    pub async fn ready(&self) -> BusResult<()> {
        let mut rx = self.ready_tx.subscribe();
        let signal = *rx
            .wait_for(|signal| *signal != ReadySignal::Pending)
            .await
            .map_err(|_| BusError::Closed)?;

        match signal {
            ReadySignal::Ready => Ok(()),
            ReadySignal::Pending | ReadySignal::Abandoned => Err(BusError::Closed),
        }
    }
}
