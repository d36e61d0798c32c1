//! Request/reply correlation
//!
//! Each request gets its own reply inbox. The inbox subscription id keys the
//! pending entry, and the reply and the deadline race to remove that entry.
//! Whichever side removes it settles the request; the loser finds nothing and
//! is ignored.

use crate::envelope::ResponseEnvelope;
use crate::error::{validate_subject, BusError, BusResult};
use crate::identity::IdentityProvider;
use crate::observability::redaction::screen_payload;
use crate::transport::{InboundMessage, SubscribeOptions, SubscriptionId, Transport};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error};

#[derive(Debug)]
struct PendingRequest {
    correlation_id: String,
    subject: String,
    deadline: Instant,
    resolver: oneshot::Sender<Bytes>,
}

/// Tracks outstanding requests and settles each exactly once
pub struct RequestCorrelator {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    timeout: Duration,
    pending: Mutex<HashMap<SubscriptionId, PendingRequest>>,
}

impl RequestCorrelator {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            identity,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of requests still waiting for a reply
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send `message` on `subject` and wait for the reply
    ///
    /// Fails with [`BusError::RequestTimeout`] when no reply arrives within
    /// the configured timeout and with [`BusError::RequestFailed`] when the
    /// responder reports an error.
    pub async fn request<Req, Res>(&self, subject: &str, message: &Req) -> BusResult<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        validate_subject(subject)?;

        let correlation_id = self.identity.next_token();
        let body = serde_json::to_value(message)?;
        let payload = Bytes::from(serde_json::to_vec(&body)?);

        let inbox = self.transport.new_inbox();
        let (resolver, mut reply_rx) = oneshot::channel();
        let sid = {
            // Held across the subscribe so the reply cannot beat the entry
            let mut pending = self.pending.lock().await;
            let sid = self
                .transport
                .subscribe(&inbox, SubscribeOptions::default())
                .await?;
            pending.insert(
                sid,
                PendingRequest {
                    correlation_id: correlation_id.clone(),
                    subject: subject.to_string(),
                    deadline: Instant::now() + self.timeout,
                    resolver,
                },
            );
            sid
        };

        debug!(
            correlation_id = %correlation_id,
            subject = %subject,
            request = %screen_payload(&body),
            "[>> {} >>]",
            correlation_id
        );

        if let Err(e) = self.transport.publish(subject, payload, Some(&inbox)).await {
            self.retire(sid).await;
            self.release_inbox(sid).await;
            error!(correlation_id = %correlation_id, subject = %subject, error = %e, "[!! {} !!]", correlation_id);
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.timeout, &mut reply_rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_elapsed) => self.reply_after_deadline(sid, reply_rx).await,
        };
        self.release_inbox(sid).await;

        let Some(reply) = reply else {
            error!(
                correlation_id = %correlation_id,
                subject = %subject,
                error = crate::error::TIMEOUT_MESSAGE,
                "[!! {} !!]",
                correlation_id
            );
            return Err(BusError::request_timeout(correlation_id));
        };

        self.complete(subject, correlation_id, &reply)
    }

    fn complete<Res: DeserializeOwned>(
        &self,
        subject: &str,
        correlation_id: String,
        reply: &[u8],
    ) -> BusResult<Res> {
        let envelope = match ResponseEnvelope::decode(reply) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(correlation_id = %correlation_id, subject = %subject, error = %e, "[!! {} !!]", correlation_id);
                return Err(BusError::request_failed(e.to_string(), correlation_id));
            }
        };

        match envelope {
            ResponseEnvelope::Failure(payload) => {
                error!(
                    correlation_id = %correlation_id,
                    subject = %subject,
                    error = %payload.message,
                    "[!! {} !!]",
                    correlation_id
                );
                Err(BusError::request_failed(payload.message, correlation_id))
            }
            ResponseEnvelope::Success(value) => {
                debug!(
                    correlation_id = %correlation_id,
                    subject = %subject,
                    response = %screen_payload(&value),
                    "[<< {} <<]",
                    correlation_id
                );
                Ok(serde_json::from_value(value)?)
            }
        }
    }

    /// Hand an inbound message to its waiting request
    ///
    /// Returns false when the message does not belong to a pending request.
    pub async fn settle(&self, message: &InboundMessage) -> bool {
        let Some(entry) = self.retire(message.sid).await else {
            return false;
        };

        debug!(
            correlation_id = %entry.correlation_id,
            subject = %entry.subject,
            remaining_ms = (entry.deadline.saturating_duration_since(Instant::now()).as_millis() as u64),
            "Reply received"
        );
        // The requester may already be gone
        let _ = entry.resolver.send(message.payload.clone());
        true
    }

    /// Outcome once the deadline has passed
    ///
    /// If a reply already retired the entry it owns settlement, and its
    /// payload is on the way even if not yet sent.
    async fn reply_after_deadline(
        &self,
        sid: SubscriptionId,
        reply_rx: oneshot::Receiver<Bytes>,
    ) -> Option<Bytes> {
        if self.retire(sid).await.is_some() {
            return None;
        }
        reply_rx.await.ok()
    }

    async fn retire(&self, sid: SubscriptionId) -> Option<PendingRequest> {
        self.pending.lock().await.remove(&sid)
    }

    async fn release_inbox(&self, sid: SubscriptionId) {
        if let Err(e) = self.transport.unsubscribe(sid).await {
            debug!(sid = %sid, error = %e, "Failed to release reply inbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TridIdentity;
    use crate::testing::{MemoryBroker, MemoryTransport};
    use crate::transport::{TransportEvent, TransportEvents};
    use serde_json::{json, Value};

    fn setup(timeout_ms: u64) -> (MemoryBroker, Arc<MemoryTransport>, TransportEvents, Arc<RequestCorrelator>) {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.connect();
        let transport = Arc::new(transport);
        let correlator = Arc::new(RequestCorrelator::new(
            transport.clone(),
            Arc::new(TridIdentity::new("test")),
            Duration::from_millis(timeout_ms),
        ));
        (broker, transport, events, correlator)
    }

    /// Answer every request on the broker with `reply`, routing replies through the correlator
    fn spawn_responder(
        responder: MemoryTransport,
        mut responder_events: TransportEvents,
        mut requester_events: TransportEvents,
        correlator: Arc<RequestCorrelator>,
        reply: &'static [u8],
    ) {
        tokio::spawn(async move {
            while let Some(event) = responder_events.recv().await {
                if let TransportEvent::Message(message) = event {
                    if let Some(reply_to) = message.reply_to {
                        let _ = responder
                            .publish(&reply_to, Bytes::from_static(reply), None)
                            .await;
                    }
                }
            }
        });
        tokio::spawn(async move {
            while let Some(event) = requester_events.recv().await {
                if let TransportEvent::Message(message) = event {
                    correlator.settle(&message).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_resolves_with_result() {
        let (broker, _transport, events, correlator) = setup(1_000);
        let (responder, responder_events) = broker.connect();
        responder
            .subscribe("svc", SubscribeOptions::default())
            .await
            .unwrap();
        spawn_responder(responder, responder_events, events, correlator.clone(), br#"[null,{"ok":true}]"#);

        let result: Value = correlator.request("svc", &json!({"q": 1})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_failure_carries_correlation_id() {
        let (broker, _transport, events, correlator) = setup(1_000);
        let (responder, responder_events) = broker.connect();
        responder
            .subscribe("svc", SubscribeOptions::default())
            .await
            .unwrap();
        spawn_responder(responder, responder_events, events, correlator.clone(), br#"[{"message":"nope"},null]"#);

        let err = correlator
            .request::<_, Value>("svc", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert!(err.correlation_id().is_some_and(|id| id.starts_with("test-")));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (_broker, _transport, _events, correlator) = setup(50);

        let err = correlator
            .request::<_, Value>("nobody.home", &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "response timeout");
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_ignored() {
        let (_broker, _transport, _events, correlator) = setup(20);

        let err = correlator
            .request::<_, Value>("slow", &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let handled = correlator
            .settle(&InboundMessage {
                sid: SubscriptionId(1),
                subject: "_INBOX.late".to_string(),
                payload: Bytes::from_static(b"[null,1]"),
                reply_to: None,
            })
            .await;
        assert!(!handled);
    }

    fn pending_entry(correlator: &RequestCorrelator, sid: SubscriptionId) -> oneshot::Receiver<Bytes> {
        let (resolver, reply_rx) = oneshot::channel();
        let entry = PendingRequest {
            correlation_id: "test-1".to_string(),
            subject: "svc".to_string(),
            deadline: Instant::now(),
            resolver,
        };
        correlator
            .pending
            .try_lock()
            .expect("uncontended in tests")
            .insert(sid, entry);
        reply_rx
    }

    #[tokio::test]
    async fn test_reply_claimed_before_deadline_wins() {
        let (_broker, _transport, _events, correlator) = setup(1_000);
        let sid = SubscriptionId(42);
        let reply_rx = pending_entry(&correlator, sid);

        // The reply has taken the entry but not yet handed over its payload
        let claimed = correlator.retire(sid).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = claimed.resolver.send(Bytes::from_static(b"[null,7]"));
        });

        let reply = correlator.reply_after_deadline(sid, reply_rx).await;
        assert_eq!(reply.as_deref(), Some(&b"[null,7]"[..]));
    }

    #[tokio::test]
    async fn test_deadline_claims_unanswered_entry() {
        let (_broker, _transport, _events, correlator) = setup(1_000);
        let sid = SubscriptionId(43);
        let reply_rx = pending_entry(&correlator, sid);

        assert!(correlator.reply_after_deadline(sid, reply_rx).await.is_none());
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_retires_entry() {
        let (broker, _transport, _events, correlator) = setup(1_000);
        broker.fail_publishes(true);

        let err = correlator
            .request::<_, Value>("svc", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
        assert_eq!(correlator.pending_count().await, 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_envelope_fails_request() {
        let (broker, _transport, events, correlator) = setup(1_000);
        let (responder, responder_events) = broker.connect();
        responder
            .subscribe("svc", SubscribeOptions::default())
            .await
            .unwrap();
        spawn_responder(responder, responder_events, events, correlator.clone(), b"{\"not\":\"an envelope\"}");

        let err = correlator
            .request::<_, Value>("svc", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestFailed { .. }));
        assert!(err.to_string().contains("invalid response envelope"));
    }
}
