//! Impure I/O for the MQTT transport
//!
//! Owns the `rumqttc` client and a supervisor task polling its event loop.
//! The supervisor translates broker traffic into [`TransportEvent`]s, replays
//! subscriptions after a reconnect and backs off between reconnection attempts.
//!
//! The supervisor is the only task draining the client's request channel, so
//! it never waits on that channel itself, and the subscription table lock is
//! never held across a send.

use super::connection::{configure_mqtt_options, TopicBuilder};
use super::link_monitor::{LinkMonitor, LinkSignal};
use super::message_handler::{EventRoute, MessageHandler, SubscriptionTable, INBOX_BROKER_ID};
use crate::config::{MqttSection, ReconnectConfig};
use crate::observability::redaction::screen_text;
use crate::transport::{
    InboundMessage, SubscribeOptions, SubscriptionId, Transport, TransportError, TransportEvent,
    TransportEventSender, TransportEvents,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{PublishProperties, SubscribeProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

type SharedTable = Arc<Mutex<SubscriptionTable>>;

fn lock_table(table: &SharedTable) -> MutexGuard<'_, SubscriptionTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn subscribe_props(broker_id: usize) -> SubscribeProperties {
    SubscribeProperties {
        id: Some(broker_id),
        user_properties: Vec::new(),
    }
}

/// MQTT v5 implementation of [`Transport`]
///
/// Reply inboxes are served by one wildcard subscription per connection, so
/// a request costs a single publish on the wire.
pub struct MqttTransport {
    client_id: String,
    server: String,
    client: AsyncClient,
    table: SharedTable,
    next_sid: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and start polling the broker
    ///
    /// Returns as soon as the supervisor is running; the connection outcome is
    /// reported on the returned event stream.
    pub async fn connect(
        client_id: &str,
        config: &MqttSection,
        reconnect: ReconnectConfig,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let (mqtt_options, endpoint) = configure_mqtt_options(client_id, config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let table = Arc::new(Mutex::new(SubscriptionTable::with_inbox(client_id)));

        // Queued ahead of any request; sent once the first ConnAck arrives
        client
            .try_subscribe_with_properties(
                TopicBuilder::inbox_filter(client_id),
                QoS::AtLeastOnce,
                subscribe_props(INBOX_BROKER_ID),
            )
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;

        info!(
            client_id = %client_id,
            server = %endpoint.address(),
            "Starting MQTT event loop"
        );

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            table.clone(),
            events_tx,
            reconnect,
            shutdown_rx,
        ));

        Ok((
            Self {
                client_id: client_id.to_string(),
                server: endpoint.address(),
                client,
                table,
                next_sid: AtomicU64::new(1),
                shutdown_tx,
                event_loop_handle: Mutex::new(Some(handle)),
            },
            events_rx,
        ))
    }

    fn allocate_sid(&self) -> SubscriptionId {
        SubscriptionId(self.next_sid.fetch_add(1, Ordering::SeqCst))
    }

    fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.event_loop_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError> {
        let props = PublishProperties {
            response_topic: reply_to.map(str::to_string),
            ..Default::default()
        };

        self.client
            .publish_with_properties(subject, QoS::AtLeastOnce, false, payload, props)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, TransportError> {
        let sid = self.allocate_sid();
        let filter = TopicBuilder::build_filter(subject, options.queue.as_deref());

        subscribe_filter(&self.client, &self.table, sid, &filter).await?;

        debug!(target: "mqtt_transport", sid = %sid, filter = %filter, "Subscribed");
        Ok(sid)
    }

    async fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError> {
        let removed = lock_table(&self.table).remove(sid);
        match removed {
            Some((filter, true)) => {
                self.client
                    .unsubscribe(filter.clone())
                    .await
                    .map_err(|e| TransportError::UnsubscribeFailed(Box::new(e)))?;
                debug!(target: "mqtt_transport", sid = %sid, filter = %filter, "Unsubscribed");
                Ok(())
            }
            Some((_, false)) => Ok(()),
            None => Err(TransportError::UnsubscribeFailed(
                format!("unknown subscription {sid}").into(),
            )),
        }
    }

    fn new_inbox(&self) -> String {
        TopicBuilder::build_inbox(&self.client_id)
    }

    fn server(&self) -> String {
        self.server.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _ = self.shutdown_tx.send(true);

        // The broker may already be gone; closing is best effort from here on
        if let Err(e) = self.client.disconnect().await {
            debug!(target: "mqtt_transport", "Disconnect request not sent: {}", e);
        }

        if let Some(handle) = self.take_handle() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT event loop ended with error: {}", e),
                Err(_) => warn!("MQTT event loop didn't shut down gracefully, forcing abort"),
                _ => {}
            }
        }

        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.take_handle() {
            handle.abort();
        }
    }
}

/// Record `sid` and ask the broker for `filter` if nothing covers it yet
///
/// The table lock is released before the request is queued; a failed send
/// rolls the entry back.
async fn subscribe_filter(
    client: &AsyncClient,
    table: &SharedTable,
    sid: SubscriptionId,
    filter: &str,
) -> Result<(), TransportError> {
    let broker_id = lock_table(table).insert(sid, filter)?;
    let Some(broker_id) = broker_id else {
        return Ok(());
    };

    if let Err(e) = client
        .subscribe_with_properties(filter, QoS::AtLeastOnce, subscribe_props(broker_id))
        .await
    {
        lock_table(table).remove(sid);
        return Err(TransportError::SubscriptionFailed(Box::new(e)));
    }
    Ok(())
}

/// Supervisor loop: poll, route, back off on errors
async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    table: SharedTable,
    events: TransportEventSender,
    reconnect: ReconnectConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut monitor = LinkMonitor::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping MQTT event loop");
                    break;
                }
            }

            polled = event_loop.poll() => {
                match polled {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        if !handle_route(route, &mut monitor, &client, &table, &events) {
                            break;
                        }
                    }
                    Err(e) => {
                        let signals = monitor.on_connection_error();
                        if signals.contains(&LinkSignal::ConnectionFailed) {
                            let reason = screen_text(&e.to_string());
                            error!("MQTT connection could not be established: {}", reason);
                            let _ = events.send(TransportEvent::Error(
                                TransportError::ConnectionFailed(reason.into()),
                            ));
                            break;
                        }

                        warn!(
                            attempt = monitor.attempts(),
                            "MQTT connection error: {}",
                            screen_text(&e.to_string())
                        );
                        if !forward_signals(&signals, &events) {
                            break;
                        }

                        let delay = monitor.next_delay(&reconnect);
                        if !interruptible_sleep(shutdown_rx.clone(), delay).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!(target: "mqtt_transport", "MQTT event loop stopped");
}

/// Returns false once the client side of the event stream is gone
///
/// Never waits: the caller is the task that drains the request channel.
fn handle_route(
    route: EventRoute,
    monitor: &mut LinkMonitor,
    client: &AsyncClient,
    table: &SharedTable,
    events: &TransportEventSender,
) -> bool {
    match route {
        EventRoute::ConnectionAcknowledged => {
            let signal = monitor.on_connack();
            if signal == LinkSignal::Reconnect {
                let filters = lock_table(table).broker_filters();
                spawn_replay(client.clone(), filters);
            }
            forward_signals(&[signal], events)
        }
        EventRoute::MessageReceived {
            topic,
            payload,
            reply_to,
            subscription_ids,
        } => {
            let sids = lock_table(table).resolve(&topic, &subscription_ids);
            if sids.is_empty() {
                debug!(target: "mqtt_transport", topic = %topic, "Message for no local subscription");
            }
            for sid in sids {
                let message = InboundMessage {
                    sid,
                    subject: topic.clone(),
                    payload: payload.clone(),
                    reply_to: reply_to.clone(),
                };
                if events.send(TransportEvent::Message(message)).is_err() {
                    return false;
                }
            }
            true
        }
        EventRoute::Disconnected => {
            let signals = monitor.on_broker_disconnect();
            forward_signals(&signals, events)
        }
        EventRoute::SubscriptionConfirmed { packet_id } => {
            debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
            true
        }
        EventRoute::InfrastructureEvent(event_str) => {
            debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
            true
        }
        EventRoute::OutgoingEvent => true,
    }
}

fn forward_signals(signals: &[LinkSignal], events: &TransportEventSender) -> bool {
    for signal in signals {
        let event = match signal {
            LinkSignal::Connect => TransportEvent::Connect,
            LinkSignal::Disconnect => TransportEvent::Disconnect,
            LinkSignal::Reconnecting => TransportEvent::Reconnecting,
            LinkSignal::Reconnect => TransportEvent::Reconnect,
            LinkSignal::ConnectionFailed => TransportEvent::Error(TransportError::ConnectionFailed(
                "connection could not be established".into(),
            )),
        };
        if events.send(event).is_err() {
            return false;
        }
    }
    true
}

/// Replay broker filters after a clean-start reconnect
///
/// Runs beside the supervisor, which keeps draining the request channel
/// however many filters are queued.
fn spawn_replay(client: AsyncClient, filters: Vec<(String, usize)>) -> JoinHandle<()> {
    tokio::spawn(async move {
        for (filter, broker_id) in filters {
            match client
                .subscribe_with_properties(filter.clone(), QoS::AtLeastOnce, subscribe_props(broker_id))
                .await
            {
                Ok(()) => debug!(target: "mqtt_transport", "Re-subscribed to: {}", filter),
                Err(e) => {
                    error!("Failed to re-subscribe to {}: {}", filter, e);
                    break;
                }
            }
        }
    })
}

/// Returns true if the sleep completed, false if shutdown was requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}
