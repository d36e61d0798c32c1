//! Subscription registry
//!
//! Owns every handler registered by the application and maps the four
//! delivery modes onto transport subscriptions:
//!
//! | Mode | Queue group |
//! |---|---|
//! | broadcast | none, every client receives |
//! | listener | `<subject>.listeners` |
//! | queue worker | `<subject>.workers.<group>` |
//! | one-shot | none, removed after the first delivery |

use crate::envelope::{HandlerError, ResponseEnvelope};
use crate::error::{validate_subject, BusError, BusResult};
use crate::observability::redaction::screen_payload;
use crate::transport::{InboundMessage, SubscribeOptions, SubscriptionId, Transport};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

pub type BroadcastHandler = Arc<dyn Fn(Value, Option<String>, String) + Send + Sync>;
pub type WorkerHandler = Arc<dyn Fn(Value, String) + Send + Sync>;
pub type ListenerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
pub type ListenerHandler = Arc<dyn Fn(Value) -> ListenerFuture + Send + Sync>;
pub type OnceHandler = Box<dyn FnOnce(Value, String) + Send>;

/// Delivery mode of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Broadcast,
    QueueWorker,
    Listener,
    OneShot,
}

enum Handler {
    Broadcast(BroadcastHandler),
    Worker(WorkerHandler),
    Listener(ListenerHandler),
    Once(OnceHandler),
}

/// Registered handler and its routing data
pub struct Subscription {
    pub id: SubscriptionId,
    pub subject: String,
    pub mode: SubscriptionMode,
    handler: Handler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Queue group shared by every listener of a subject
pub fn listener_group(subject: &str) -> String {
    format!("{subject}.listeners")
}

/// Queue group shared by the workers of one configured group
pub fn worker_group(subject: &str, group: &str) -> String {
    format!("{subject}.workers.{group}")
}

fn decode_message(payload: &[u8]) -> Result<Value, serde_json::Error> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload)
}

/// Handler table keyed by transport subscription id
pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    group: String,
    entries: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn Transport>, group: impl Into<String>) -> Self {
        Self {
            transport,
            group: group.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Every client receives every message
    pub async fn broadcast<F>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Value, Option<String>, String) + Send + Sync + 'static,
    {
        self.register(
            subject,
            SubscribeOptions::default(),
            SubscriptionMode::Broadcast,
            Handler::Broadcast(Arc::new(handler)),
        )
        .await
    }

    /// Answer requests; exactly one listener per subject handles each request
    pub async fn listen<F, Fut>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: ListenerHandler =
            Arc::new(move |message| -> ListenerFuture { Box::pin(handler(message)) });
        self.register(
            subject,
            SubscribeOptions::queue(listener_group(subject)),
            SubscriptionMode::Listener,
            Handler::Listener(handler),
        )
        .await
    }

    /// Take work; exactly one client per configured group receives each message
    pub async fn process<F>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Value, String) + Send + Sync + 'static,
    {
        self.register(
            subject,
            SubscribeOptions::queue(worker_group(subject, &self.group)),
            SubscriptionMode::QueueWorker,
            Handler::Worker(Arc::new(handler)),
        )
        .await
    }

    /// Handle the first message only
    ///
    /// The subscription is removed before the handler runs. A second message
    /// already in flight at the transport when the unsubscribe is issued is
    /// dropped here rather than delivered.
    pub async fn subscribe_once<F>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: FnOnce(Value, String) + Send + 'static,
    {
        self.register(
            subject,
            SubscribeOptions::default(),
            SubscriptionMode::OneShot,
            Handler::Once(Box::new(handler)),
        )
        .await
    }

    async fn register(
        &self,
        subject: &str,
        options: SubscribeOptions,
        mode: SubscriptionMode,
        handler: Handler,
    ) -> BusResult<SubscriptionId> {
        validate_subject(subject)?;

        // Held across the subscribe so deliveries never see an unknown id
        let mut entries = self.entries.lock().await;
        let id = self.transport.subscribe(subject, options.clone()).await?;
        entries.insert(
            id,
            Subscription {
                id,
                subject: subject.to_string(),
                mode,
                handler,
            },
        );

        debug!(
            subject = %subject,
            sid = %id,
            mode = ?mode,
            queue = ?options.queue,
            "Subscribed"
        );
        Ok(id)
    }

    /// Remove a subscription and stop its delivery
    pub async fn unsubscribe(&self, id: SubscriptionId) -> BusResult<()> {
        let removed = self.entries.lock().await.remove(&id);
        let subscription = removed.ok_or(BusError::UnknownSubscription(id))?;

        self.transport.unsubscribe(id).await?;
        debug!(subject = %subscription.subject, sid = %id, "Unsubscribed");
        Ok(())
    }

    pub async fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Route an inbound message to its handler; false when the id is unknown
    pub async fn dispatch(&self, message: InboundMessage) -> bool {
        let handler = {
            let mut entries = self.entries.lock().await;
            take_handler(&mut entries, message.sid)
        };

        let Some(handler) = handler else {
            debug!(
                subject = %message.subject,
                sid = %message.sid,
                "Dropping message for unknown subscription"
            );
            return false;
        };

        match handler {
            Handler::Broadcast(handler) => {
                if let Some(value) = self.decode_or_drop(&message) {
                    handler(value, message.reply_to, message.subject);
                }
            }
            Handler::Worker(handler) => {
                if let Some(value) = self.decode_or_drop(&message) {
                    handler(value, message.subject);
                }
            }
            Handler::Once(handler) => {
                if let Err(e) = self.transport.unsubscribe(message.sid).await {
                    warn!(subject = %message.subject, sid = %message.sid, error = %e, "One-shot unsubscribe failed");
                }
                if let Some(value) = self.decode_or_drop(&message) {
                    handler(value, message.subject);
                }
            }
            Handler::Listener(handler) => {
                let transport = self.transport.clone();
                tokio::spawn(answer_request(transport, handler, message));
            }
        }
        true
    }

    fn decode_or_drop(&self, message: &InboundMessage) -> Option<Value> {
        match decode_message(&message.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    subject = %message.subject,
                    sid = %message.sid,
                    error = %e,
                    "Dropping message with invalid JSON payload"
                );
                None
            }
        }
    }
}

/// Handler for a delivery; one-shot entries are removed from the table
fn take_handler(
    entries: &mut HashMap<SubscriptionId, Subscription>,
    sid: SubscriptionId,
) -> Option<Handler> {
    if entries.get(&sid)?.mode == SubscriptionMode::OneShot {
        return entries.remove(&sid).map(|s| s.handler);
    }

    match &entries.get(&sid)?.handler {
        Handler::Broadcast(h) => Some(Handler::Broadcast(h.clone())),
        Handler::Worker(h) => Some(Handler::Worker(h.clone())),
        Handler::Listener(h) => Some(Handler::Listener(h.clone())),
        Handler::Once(_) => None,
    }
}

/// Run a listener handler and publish its envelope to the reply address
async fn answer_request(
    transport: Arc<dyn Transport>,
    handler: ListenerHandler,
    message: InboundMessage,
) {
    let outcome = match decode_message(&message.payload) {
        Ok(value) => handler(value).await,
        Err(e) => Err(HandlerError::from(e)),
    };

    if let Err(e) = &outcome {
        debug!(subject = %message.subject, error = %e, "Listener failed");
    }

    let Some(reply_to) = message.reply_to else {
        debug!(subject = %message.subject, "No reply address, dropping response");
        return;
    };

    let envelope = ResponseEnvelope::from_outcome(outcome);
    debug!(
        subject = %message.subject,
        reply_to = %reply_to,
        response = %screen_payload(&envelope.to_value()),
        "Sending response"
    );

    if let Err(e) = transport
        .publish(&reply_to, Bytes::from(envelope.encode()), None)
        .await
    {
        error!(subject = %message.subject, reply_to = %reply_to, error = %e, "Failed to publish response");
    }
}
