//! Pure message routing for MQTT events
//!
//! Turns `rumqttc` events into routing decisions and keeps the mapping between
//! local subscription ids and broker-side subscription filters.

use super::connection::TopicBuilder;
use crate::transport::{SubscriptionId, TransportError};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use std::collections::{HashMap, VecDeque};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged by the broker
    ConnectionAcknowledged,
    /// Message received on a subscribed filter
    MessageReceived {
        topic: String,
        payload: Bytes,
        reply_to: Option<String>,
        subscription_ids: Vec<usize>,
    },
    /// Broker closed the session
    Disconnected,
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16 },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Routes MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => {
                    let (reply_to, subscription_ids) = match &publish.properties {
                        Some(props) => (
                            props.response_topic.clone(),
                            props.subscription_identifiers.clone(),
                        ),
                        None => (None, Vec::new()),
                    };
                    EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.clone(),
                        reply_to,
                        subscription_ids,
                    }
                }
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Broker subscription identifier of the per-connection reply inbox filter
pub const INBOX_BROKER_ID: usize = 1;

/// Largest subscription identifier MQTT v5 can encode
pub const MAX_BROKER_ID: usize = 268_435_455;

#[derive(Debug, Clone)]
struct FilterEntry {
    broker_id: usize,
    sids: Vec<SubscriptionId>,
}

/// Broker subscription identifiers
///
/// Fresh ids are handed out until the protocol limit, after which released
/// ids are reused oldest first.
#[derive(Debug)]
struct BrokerIdPool {
    next: usize,
    max: usize,
    released: VecDeque<usize>,
}

impl BrokerIdPool {
    fn new() -> Self {
        Self {
            next: INBOX_BROKER_ID + 1,
            max: MAX_BROKER_ID,
            released: VecDeque::new(),
        }
    }

    fn acquire(&mut self) -> Option<usize> {
        if self.next <= self.max {
            let id = self.next;
            self.next += 1;
            return Some(id);
        }
        self.released.pop_front()
    }

    fn release(&mut self, id: usize) {
        self.released.push_back(id);
    }
}

/// Reply inboxes multiplexed over one wildcard broker subscription
#[derive(Debug)]
struct InboxMux {
    prefix: String,
    filter: String,
    topics: HashMap<String, SubscriptionId>,
}

/// Local subscriptions grouped by broker filter
///
/// MQTT keys subscriptions by filter, so several local subscriptions on the
/// same filter share one broker subscription. The broker subscription id is
/// fixed when the filter is first subscribed and returned to the pool when
/// its last local subscription goes away.
///
/// Reply inboxes under the connection's inbox prefix never reach the broker
/// individually; they are routed by exact topic from the single inbox filter.
#[derive(Debug)]
pub struct SubscriptionTable {
    filters: HashMap<String, FilterEntry>,
    by_sid: HashMap<SubscriptionId, String>,
    broker_ids: BrokerIdPool,
    inbox: Option<InboxMux>,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
            by_sid: HashMap::new(),
            broker_ids: BrokerIdPool::new(),
            inbox: None,
        }
    }

    /// Table that multiplexes the reply inboxes of `client_id`
    pub fn with_inbox(client_id: &str) -> Self {
        Self {
            inbox: Some(InboxMux {
                prefix: TopicBuilder::inbox_prefix(client_id),
                filter: TopicBuilder::inbox_filter(client_id),
                topics: HashMap::new(),
            }),
            ..Self::new()
        }
    }

    /// Broker filter carrying every reply inbox, when multiplexing
    pub fn inbox_filter(&self) -> Option<&str> {
        self.inbox.as_ref().map(|inbox| inbox.filter.as_str())
    }

    fn inbox_for(&mut self, topic: &str) -> Option<&mut InboxMux> {
        self.inbox
            .as_mut()
            .filter(|inbox| topic.starts_with(&inbox.prefix))
    }

    /// Record a subscription
    ///
    /// Returns the broker subscription id when the broker must be asked to
    /// subscribe, `None` when an existing broker subscription covers it.
    pub fn insert(
        &mut self,
        sid: SubscriptionId,
        filter: &str,
    ) -> Result<Option<usize>, TransportError> {
        if let Some(inbox) = self.inbox_for(filter) {
            inbox.topics.insert(filter.to_string(), sid);
            self.by_sid.insert(sid, filter.to_string());
            return Ok(None);
        }

        if let Some(entry) = self.filters.get_mut(filter) {
            entry.sids.push(sid);
            self.by_sid.insert(sid, filter.to_string());
            return Ok(None);
        }

        let broker_id = self.broker_ids.acquire().ok_or_else(|| {
            TransportError::SubscriptionFailed(
                format!("no free subscription identifier for {filter}").into(),
            )
        })?;
        self.filters.insert(
            filter.to_string(),
            FilterEntry {
                broker_id,
                sids: vec![sid],
            },
        );
        self.by_sid.insert(sid, filter.to_string());
        Ok(Some(broker_id))
    }

    /// Forget a subscription
    ///
    /// Returns the filter and whether the broker must be asked to unsubscribe.
    pub fn remove(&mut self, sid: SubscriptionId) -> Option<(String, bool)> {
        let filter = self.by_sid.remove(&sid)?;

        if let Some(inbox) = self.inbox_for(&filter) {
            inbox.topics.remove(&filter);
            return Some((filter, false));
        }

        let last = match self.filters.get_mut(&filter) {
            Some(entry) => {
                entry.sids.retain(|s| *s != sid);
                entry.sids.is_empty()
            }
            None => false,
        };
        if last {
            if let Some(entry) = self.filters.remove(&filter) {
                self.broker_ids.release(entry.broker_id);
            }
        }
        Some((filter, last))
    }

    /// Local subscriptions a received message belongs to
    ///
    /// Inbox topics resolve by exact topic. Everything else uses broker
    /// subscription identifiers when present, otherwise matches the topic
    /// against each filter's topic.
    pub fn resolve(&self, topic: &str, subscription_ids: &[usize]) -> Vec<SubscriptionId> {
        if let Some(inbox) = self
            .inbox
            .as_ref()
            .filter(|inbox| topic.starts_with(&inbox.prefix))
        {
            return inbox.topics.get(topic).copied().into_iter().collect();
        }

        let mut sids: Vec<SubscriptionId> = if subscription_ids.is_empty() {
            self.filters
                .iter()
                .filter(|(filter, _)| TopicBuilder::filter_topic(filter) == topic)
                .flat_map(|(_, entry)| entry.sids.iter().copied())
                .collect()
        } else {
            self.filters
                .values()
                .filter(|entry| subscription_ids.contains(&entry.broker_id))
                .flat_map(|entry| entry.sids.iter().copied())
                .collect()
        };
        sids.sort();
        sids
    }

    /// Broker filters with their subscription ids, for replay after reconnect
    pub fn broker_filters(&self) -> Vec<(String, usize)> {
        self.inbox
            .iter()
            .map(|inbox| (inbox.filter.clone(), INBOX_BROKER_ID))
            .chain(
                self.filters
                    .iter()
                    .map(|(filter, entry)| (filter.clone(), entry.broker_id)),
            )
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{Publish, PublishProperties};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_publish_with_properties() {
        let mut publish = Publish::new("request.ok", QoS::AtLeastOnce, "{\"foo\":\"bar\"}", None);
        publish.properties = Some(PublishProperties {
            response_topic: Some("_INBOX/c/1".to_string()),
            subscription_identifiers: vec![7],
            ..Default::default()
        });

        match MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish))) {
            EventRoute::MessageReceived {
                topic,
                payload,
                reply_to,
                subscription_ids,
            } => {
                assert_eq!(topic, "request.ok");
                assert_eq!(&payload[..], b"{\"foo\":\"bar\"}");
                assert_eq!(reply_to.as_deref(), Some("_INBOX/c/1"));
                assert_eq!(subscription_ids, vec![7]);
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_publish_without_properties() {
        let publish = Publish::new("broadcast", QoS::AtMostOnce, "{}", None);
        match MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish))) {
            EventRoute::MessageReceived {
                reply_to,
                subscription_ids,
                ..
            } => {
                assert!(reply_to.is_none());
                assert!(subscription_ids.is_empty());
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_table_shares_filters() {
        let mut table = SubscriptionTable::new();
        assert_eq!(table.insert(SubscriptionId(1), "jobs").unwrap(), Some(2));
        assert_eq!(table.insert(SubscriptionId(2), "jobs").unwrap(), None);
        assert_eq!(table.insert(SubscriptionId(3), "$share/g/jobs").unwrap(), Some(3));

        assert_eq!(table.broker_filters().len(), 2);

        assert_eq!(table.remove(SubscriptionId(1)), Some(("jobs".to_string(), false)));
        assert_eq!(table.remove(SubscriptionId(2)), Some(("jobs".to_string(), true)));
        assert_eq!(table.remove(SubscriptionId(2)), None);
        assert_eq!(table.broker_filters().len(), 1);
    }

    #[test]
    fn test_table_resolves_by_subscription_id() {
        let mut table = SubscriptionTable::new();
        table.insert(SubscriptionId(1), "jobs").unwrap();
        table.insert(SubscriptionId(2), "jobs").unwrap();
        table.insert(SubscriptionId(3), "$share/g/jobs").unwrap();

        assert_eq!(
            table.resolve("jobs", &[2]),
            vec![SubscriptionId(1), SubscriptionId(2)]
        );
        assert_eq!(table.resolve("jobs", &[3]), vec![SubscriptionId(3)]);
    }

    #[test]
    fn test_table_resolves_by_topic_without_ids() {
        let mut table = SubscriptionTable::new();
        table.insert(SubscriptionId(1), "jobs").unwrap();
        table.insert(SubscriptionId(3), "$share/g/jobs").unwrap();
        table.insert(SubscriptionId(4), "other").unwrap();

        assert_eq!(
            table.resolve("jobs", &[]),
            vec![SubscriptionId(1), SubscriptionId(3)]
        );
        assert!(table.resolve("missing", &[]).is_empty());
    }

    #[test]
    fn test_broker_id_survives_first_subscriber_removal() {
        let mut table = SubscriptionTable::new();
        table.insert(SubscriptionId(1), "jobs").unwrap();
        table.insert(SubscriptionId(2), "jobs").unwrap();
        table.remove(SubscriptionId(1));

        assert_eq!(table.resolve("jobs", &[2]), vec![SubscriptionId(2)]);
        assert_eq!(table.broker_filters(), vec![("jobs".to_string(), 2)]);
    }

    #[test]
    fn test_inboxes_share_one_broker_subscription() {
        let mut table = SubscriptionTable::with_inbox("c");
        assert_eq!(table.inbox_filter(), Some("_INBOX/c/#"));

        for n in 1..=1_000u64 {
            let inbox = format!("_INBOX/c/{n}");
            assert_eq!(table.insert(SubscriptionId(n), &inbox).unwrap(), None);
        }
        assert_eq!(
            table.broker_filters(),
            vec![("_INBOX/c/#".to_string(), INBOX_BROKER_ID)]
        );

        assert_eq!(
            table.resolve("_INBOX/c/7", &[INBOX_BROKER_ID]),
            vec![SubscriptionId(7)]
        );
        assert_eq!(
            table.remove(SubscriptionId(7)),
            Some(("_INBOX/c/7".to_string(), false))
        );
        assert!(table.resolve("_INBOX/c/7", &[INBOX_BROKER_ID]).is_empty());
    }

    #[test]
    fn test_foreign_inbox_is_a_regular_filter() {
        let mut table = SubscriptionTable::with_inbox("c");
        assert_eq!(table.insert(SubscriptionId(1), "_INBOX/other/1").unwrap(), Some(2));
    }

    #[test]
    fn test_broker_ids_stay_within_protocol_limit() {
        let mut table = SubscriptionTable::new();
        table.broker_ids.max = 3;

        assert_eq!(table.insert(SubscriptionId(1), "a").unwrap(), Some(2));
        assert_eq!(table.insert(SubscriptionId(2), "b").unwrap(), Some(3));
        assert!(matches!(
            table.insert(SubscriptionId(3), "c"),
            Err(TransportError::SubscriptionFailed(_))
        ));
        assert!(table.resolve("c", &[]).is_empty());

        table.remove(SubscriptionId(1));
        assert_eq!(table.insert(SubscriptionId(4), "c").unwrap(), Some(2));
        assert!(table
            .broker_filters()
            .iter()
            .all(|(_, id)| *id <= MAX_BROKER_ID));
    }

    #[test]
    fn test_fresh_ids_preferred_over_released() {
        let mut table = SubscriptionTable::new();
        table.insert(SubscriptionId(1), "a").unwrap();
        table.remove(SubscriptionId(1));
        assert_eq!(table.insert(SubscriptionId(2), "b").unwrap(), Some(3));
    }
}
