//! In-process transport for testing
//!
//! [`MemoryBroker`] plays the role of the message server: every
//! [`MemoryTransport`] handed out by [`MemoryBroker::connect`] shares its
//! subscription table, so several clients in one test see each other's
//! traffic. Queue groups are served round-robin per subject and group.

use crate::transport::{
    InboundMessage, SubscribeOptions, SubscriptionId, Transport, TransportError, TransportEvent,
    TransportEventSender, TransportEvents,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A message as the broker saw it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply_to: Option<String>,
}

impl PublishedMessage {
    /// Payload parsed as JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Debug, Clone)]
struct MemorySubscription {
    conn: u64,
    sid: SubscriptionId,
    subject: String,
    queue: Option<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_conn: u64,
    next_sid: u64,
    connections: HashMap<u64, TransportEventSender>,
    subscriptions: Vec<MemorySubscription>,
    cursors: HashMap<(String, String), usize>,
    published: Vec<PublishedMessage>,
    fail_publishes: bool,
}

impl BrokerState {
    fn deliver(&mut self, message: &PublishedMessage) {
        let mut targets: Vec<(u64, SubscriptionId)> = Vec::new();
        let mut groups: HashMap<String, Vec<(u64, SubscriptionId)>> = HashMap::new();

        for sub in self.subscriptions.iter().filter(|s| s.subject == message.subject) {
            match &sub.queue {
                None => targets.push((sub.conn, sub.sid)),
                Some(queue) => groups
                    .entry(queue.clone())
                    .or_default()
                    .push((sub.conn, sub.sid)),
            }
        }

        for (queue, members) in groups {
            let cursor = self
                .cursors
                .entry((message.subject.clone(), queue))
                .or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor += 1;
        }

        for (conn, sid) in targets {
            if let Some(events) = self.connections.get(&conn) {
                let _ = events.send(TransportEvent::Message(InboundMessage {
                    sid,
                    subject: message.subject.clone(),
                    payload: message.payload.clone(),
                    reply_to: message.reply_to.clone(),
                }));
            }
        }
    }
}

/// Shared in-memory message server
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a connection; its event stream starts with `Connect`
    pub fn connect(&self) -> (MemoryTransport, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(TransportEvent::Connect);

        let mut state = self.lock();
        state.next_conn += 1;
        let conn = state.next_conn;
        state.connections.insert(conn, events_tx);
        drop(state);

        (
            MemoryTransport {
                broker: self.clone(),
                conn,
            },
            events_rx,
        )
    }

    /// Every message published so far
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Messages published on one subject
    pub fn published_on(&self, subject: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions on a subject
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| s.subject == subject)
            .count()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Make every publish fail until switched back
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Send a lifecycle event to every open connection
    pub fn emit_all<F>(&self, event: F)
    where
        F: Fn() -> TransportEvent,
    {
        for events in self.lock().connections.values() {
            let _ = events.send(event());
        }
    }

    /// Simulate a broker restart seen by every connection
    pub fn restart(&self) {
        self.emit_all(|| TransportEvent::Disconnect);
        self.emit_all(|| TransportEvent::Reconnecting);
        self.emit_all(|| TransportEvent::Reconnect);
    }
}

/// One connection to a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    conn: u64,
}

impl MemoryTransport {
    /// Push an event onto this connection's stream
    pub fn inject(&self, event: TransportEvent) {
        if let Some(events) = self.broker.lock().connections.get(&self.conn) {
            let _ = events.send(event);
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_open(&self, state: &BrokerState) -> Result<(), TransportError> {
        if state.connections.contains_key(&self.conn) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        if state.fail_publishes {
            return Err(TransportError::PublishFailed("publishing disabled".into()));
        }

        let message = PublishedMessage {
            subject: subject.to_string(),
            payload,
            reply_to: reply_to.map(str::to_string),
        };
        state.deliver(&message);
        state.published.push(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, TransportError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;

        state.next_sid += 1;
        let sid = SubscriptionId(state.next_sid);
        state.subscriptions.push(MemorySubscription {
            conn: self.conn,
            sid,
            subject: subject.to_string(),
            queue: options.queue,
        });
        Ok(sid)
    }

    async fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| !(s.conn == self.conn && s.sid == sid));

        if state.subscriptions.len() == before {
            return Err(TransportError::UnsubscribeFailed(
                format!("unknown subscription {sid}").into(),
            ));
        }
        Ok(())
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }

    fn server(&self) -> String {
        "memory://broker".to_string()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.subscriptions.retain(|s| s.conn != self.conn);
        // Dropping the sender ends the event stream
        state.connections.remove(&self.conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_message(events: &mut TransportEvents) -> Option<InboundMessage> {
        loop {
            match events.try_recv().ok()? {
                TransportEvent::Message(message) => return Some(message),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_connect_emits_connect() {
        let broker = MemoryBroker::new();
        let (_transport, mut events) = broker.connect();
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Connect)));
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_plain_subscriptions_all_receive() {
        let broker = MemoryBroker::new();
        let (a, mut a_events) = broker.connect();
        let (b, mut b_events) = broker.connect();

        let a_sid = a.subscribe("news", SubscribeOptions::default()).await.unwrap();
        let b_sid = b.subscribe("news", SubscribeOptions::default()).await.unwrap();
        a.publish("news", Bytes::from_static(b"1"), None).await.unwrap();

        assert_eq!(next_message(&mut a_events).unwrap().sid, a_sid);
        assert_eq!(next_message(&mut b_events).unwrap().sid, b_sid);
    }

    #[tokio::test]
    async fn test_queue_group_round_robin() {
        let broker = MemoryBroker::new();
        let (a, mut a_events) = broker.connect();
        let (b, mut b_events) = broker.connect();

        a.subscribe("jobs", SubscribeOptions::queue("g")).await.unwrap();
        b.subscribe("jobs", SubscribeOptions::queue("g")).await.unwrap();

        for _ in 0..4 {
            a.publish("jobs", Bytes::from_static(b"{}"), None).await.unwrap();
        }

        let mut a_count = 0;
        while next_message(&mut a_events).is_some() {
            a_count += 1;
        }
        let mut b_count = 0;
        while next_message(&mut b_events).is_some() {
            b_count += 1;
        }
        assert_eq!((a_count, b_count), (2, 2));
    }

    #[tokio::test]
    async fn test_reply_to_is_delivered() {
        let broker = MemoryBroker::new();
        let (a, mut events) = broker.connect();
        a.subscribe("svc", SubscribeOptions::default()).await.unwrap();
        a.publish("svc", Bytes::from_static(b"{}"), Some("_INBOX.x"))
            .await
            .unwrap();

        let message = next_message(&mut events).unwrap();
        assert_eq!(message.reply_to.as_deref(), Some("_INBOX.x"));
        assert_eq!(broker.published_on("svc").len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_fails() {
        let broker = MemoryBroker::new();
        let (a, _events) = broker.connect();
        let sid = a.subscribe("x", SubscribeOptions::default()).await.unwrap();
        assert!(a.unsubscribe(sid).await.is_ok());
        assert!(a.unsubscribe(sid).await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let broker = MemoryBroker::new();
        let (a, mut events) = broker.connect();
        a.subscribe("x", SubscribeOptions::default()).await.unwrap();
        a.close().await.unwrap();

        assert!(matches!(events.recv().await, Some(TransportEvent::Connect)));
        assert!(events.recv().await.is_none());
        assert_eq!(broker.subscription_count("x"), 0);
        assert!(matches!(
            a.publish("x", Bytes::new(), None).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failing_publishes() {
        let broker = MemoryBroker::new();
        let (a, _events) = broker.connect();
        broker.fail_publishes(true);
        assert!(matches!(
            a.publish("x", Bytes::new(), None).await,
            Err(TransportError::PublishFailed(_))
        ));
    }
}
