//! Bus client facade
//!
//! [`BusClient`] ties one transport connection to the state machine, the
//! subscription registry and the request correlator, and runs the task that
//! pumps transport events into them.
//!
//! # Usage
//!
//! ```rust,no_run
//! use relaybus::{BusClient, BusConfig};
//! use serde_json::{json, Value};
//!
//! # tokio_test::block_on(async {
//! let client = BusClient::connect(BusConfig::default()).await?;
//! client.connected().await?;
//!
//! client
//!     .listen("math.double", |message: Value| async move {
//!         let n = message["n"].as_i64().unwrap_or_default();
//!         Ok(json!({ "n": n * 2 }))
//!     })
//!     .await?;
//!
//! let doubled: Value = client.request("math.double", &json!({ "n": 21 })).await?;
//! assert_eq!(doubled["n"], 42);
//! client.close().await?;
//! # Ok::<(), relaybus::BusError>(())
//! # });
//! ```

use crate::config::BusConfig;
use crate::connection::{ConnectionState, ConnectionStateMachine, LifecycleEvent, StateChange};
use crate::correlator::RequestCorrelator;
use crate::envelope::HandlerError;
use crate::error::{validate_subject, BusError, BusResult};
use crate::identity::{IdentityProvider, TridIdentity};
use crate::observability::redaction::{screen_payload, screen_text};
use crate::registry::SubscriptionRegistry;
use crate::transport::mqtt::MqttTransport;
use crate::transport::{SubscriptionId, Transport, TransportError, TransportEvent, TransportEvents};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Capacity of the error broadcast channel
const ERRORS_CAPACITY: usize = 32;

struct ClientInner {
    config: BusConfig,
    identity: Arc<dyn IdentityProvider>,
    transport: Arc<dyn Transport>,
    state: Arc<ConnectionStateMachine>,
    registry: Arc<SubscriptionRegistry>,
    correlator: Arc<RequestCorrelator>,
    errors_tx: broadcast::Sender<Arc<BusError>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

/// Handle to one bus connection
///
/// Cloning is cheap; all clones share the connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("id", &self.id())
            .field("group", &self.group())
            .field("server", &self.inner.transport.server())
            .field("state", &self.state())
            .finish()
    }
}

impl BusClient {
    /// Connect to the MQTT broker named in `config`
    pub async fn connect(config: BusConfig) -> BusResult<Self> {
        config.validate()?;

        let identity = Arc::new(TridIdentity::new(&config.client.group));
        let (transport, events) = MqttTransport::connect(
            identity.client_id(),
            &config.mqtt,
            config.reconnect.clone(),
        )
        .await?;

        Self::with_transport(config, identity, Arc::new(transport), events)
    }

    /// Build a client over an already connected transport
    ///
    /// Must be called from within a tokio runtime; the event pump is spawned
    /// immediately.
    pub fn with_transport(
        config: BusConfig,
        identity: Arc<dyn IdentityProvider>,
        transport: Arc<dyn Transport>,
        events: TransportEvents,
    ) -> BusResult<Self> {
        config.validate()?;

        let state = Arc::new(ConnectionStateMachine::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            transport.clone(),
            config.client.group.clone(),
        ));
        let correlator = Arc::new(RequestCorrelator::new(
            transport.clone(),
            identity.clone(),
            config.request_timeout(),
        ));
        let (errors_tx, _) = broadcast::channel(ERRORS_CAPACITY);

        let pump = EventPump {
            client_id: identity.client_id().to_string(),
            group: config.client.group.clone(),
            exit_on_connection_failure: config.client.exit_on_connection_failure,
            transport: transport.clone(),
            state: state.clone(),
            registry: registry.clone(),
            correlator: correlator.clone(),
            errors_tx: errors_tx.clone(),
        };
        let handle = tokio::spawn(pump.run(events));

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                identity,
                transport,
                state,
                registry,
                correlator,
                errors_tx,
                pump: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.inner.identity.client_id()
    }

    pub fn group(&self) -> &str {
        &self.inner.config.client.group
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    /// Stream of connection state changes
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state.subscribe_changes()
    }

    /// Current state plus change notification
    pub fn watch_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.inner.state.watch()
    }

    /// Stream of transport errors that did not end the client
    pub fn errors(&self) -> broadcast::Receiver<Arc<BusError>> {
        self.inner.errors_tx.subscribe()
    }

    pub async fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count().await
    }

    /// Completes once the client first reaches `Connected`
    pub async fn connected(&self) -> BusResult<()> {
        self.inner.state.ready().await
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.inner.state.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    /// Fire-and-forget publish
    pub async fn publish<T>(&self, subject: &str, message: &T) -> BusResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        validate_subject(subject)?;

        let body = serde_json::to_value(message)?;
        let payload = Bytes::from(serde_json::to_vec(&body)?);

        let span = crate::bus_span!(operation = "publish", subject = %subject);
        async {
            debug!(message = %screen_payload(&body), "Publishing");
            self.inner.transport.publish(subject, payload, None).await?;
            debug!("Published");
            Ok::<(), BusError>(())
        }
        .instrument(span)
        .await
    }

    /// Receive every message on `subject`
    pub async fn subscribe<F>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Value, Option<String>, String) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.inner.registry.broadcast(subject, handler).await
    }

    /// Answer requests on `subject`, load-balanced across every listener
    pub async fn listen<F, Fut>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.registry.listen(subject, handler).await
    }

    /// Take work from `subject`, load-balanced within this client's group
    pub async fn process<F>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Value, String) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.inner.registry.process(subject, handler).await
    }

    /// Handle only the first message on `subject`
    pub async fn subscribe_once<F>(&self, subject: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: FnOnce(Value, String) + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.registry.subscribe_once(subject, handler).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> BusResult<()> {
        self.inner.registry.unsubscribe(id).await
    }

    /// Send a request and wait for the single reply
    pub async fn request<Req, Res>(&self, subject: &str, message: &Req) -> BusResult<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.ensure_open()?;
        self.inner
            .correlator
            .request(subject, message)
            .instrument(crate::bus_span!(operation = "request", subject = %subject))
            .await
    }

    /// Close the connection
    ///
    /// Pending requests are not drained; they run into their timeout.
    pub async fn close(&self) -> BusResult<()> {
        if self.inner.state.apply(LifecycleEvent::Close).is_none() {
            return Ok(());
        }

        info!(
            server = %self.inner.transport.server(),
            client_id = %self.id(),
            "Closing connection"
        );
        self.inner.transport.close().await?;
        Ok(())
    }
}

/// Everything the event pump needs, without a reference back to the client
struct EventPump {
    client_id: String,
    group: String,
    exit_on_connection_failure: bool,
    transport: Arc<dyn Transport>,
    state: Arc<ConnectionStateMachine>,
    registry: Arc<SubscriptionRegistry>,
    correlator: Arc<RequestCorrelator>,
    errors_tx: broadcast::Sender<Arc<BusError>>,
}

impl EventPump {
    async fn run(self, mut events: TransportEvents) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connect => self.lifecycle(LifecycleEvent::Connect),
                TransportEvent::Disconnect => self.lifecycle(LifecycleEvent::Disconnect),
                TransportEvent::Reconnecting => self.lifecycle(LifecycleEvent::Reconnecting),
                TransportEvent::Reconnect => self.lifecycle(LifecycleEvent::Reconnect),
                TransportEvent::Message(message) => {
                    if !self.correlator.settle(&message).await {
                        self.registry.dispatch(message).await;
                    }
                }
                TransportEvent::Error(err) => {
                    if self.on_error(err).await {
                        break;
                    }
                }
            }
        }
        debug!(client_id = %self.client_id, "Event stream ended");
    }

    fn lifecycle(&self, event: LifecycleEvent) {
        let _span = crate::lifecycle_span!(event = ?event).entered();
        let Some(transition) = self.state.apply(event) else {
            return;
        };
        let server = self.transport.server();

        match event {
            LifecycleEvent::Connect => info!(
                server = %server,
                client_id = %self.client_id,
                group = %self.group,
                "Connected"
            ),
            LifecycleEvent::Disconnect if transition.report_disconnect => {
                error!(server = %server, client_id = %self.client_id, "Disconnected")
            }
            LifecycleEvent::Reconnecting => {
                info!(server = %server, client_id = %self.client_id, "Reconnecting")
            }
            LifecycleEvent::Reconnect => {
                info!(server = %server, client_id = %self.client_id, "Reconnected")
            }
            _ => {}
        }
    }

    /// Handle a transport error; true when the pump must stop
    async fn on_error(&self, err: TransportError) -> bool {
        error!(
            client_id = %self.client_id,
            "{} (code: {})",
            screen_text(&err.to_string()),
            err.code()
        );

        if !err.is_connection_failure() {
            let _ = self.errors_tx.send(Arc::new(BusError::Transport(err)));
            return false;
        }

        self.state.apply(LifecycleEvent::Close);
        if let Err(e) = self.transport.close().await {
            debug!(client_id = %self.client_id, error = %e, "Transport close after fatal error failed");
        }

        if self.exit_on_connection_failure {
            std::process::exit(1);
        }
        let _ = self.errors_tx.send(Arc::new(BusError::connection_fatal(&err)));
        true
    }
}
