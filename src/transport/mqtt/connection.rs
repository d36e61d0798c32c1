//! Pure connection configuration and topic construction for the MQTT adapter
//!
//! Subjects are used verbatim as MQTT topic names. Queue groups map onto MQTT
//! v5 shared subscriptions and reply addresses onto per-connection inbox
//! topics.

use crate::config::MqttSection;
use crate::transport::TransportError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Prefix for reply inbox topics
pub const INBOX_PREFIX: &str = "_INBOX";

/// Prefix marking an MQTT v5 shared subscription
pub const SHARED_PREFIX: &str = "$share/";

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let url =
            Url::parse(broker_url).map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" => false,
            "mqtts" => true,
            _ => return Err(TransportError::InvalidBrokerUrl(broker_url.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }

    /// `host:port` form used in logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build MQTT options for a client connection
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
) -> Result<(MqttOptions, BrokerEndpoint), TransportError> {
    let endpoint = BrokerEndpoint::parse(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials are resolved from the environment at connect time
    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    // Subscriptions are tracked locally and replayed after a reconnect
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok((mqtt_options, endpoint))
}

/// Topic and filter construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// Subscription filter for a subject, optionally inside a queue group
    pub fn build_filter(subject: &str, queue: Option<&str>) -> String {
        match queue {
            Some(group) => format!("{SHARED_PREFIX}{}/{subject}", Self::share_name(group)),
            None => subject.to_string(),
        }
    }

    /// Share names may not contain topic separators or wildcards
    pub fn share_name(group: &str) -> String {
        group
            .chars()
            .map(|c| match c {
                '/' | '+' | '#' => '_',
                other => other,
            })
            .collect()
    }

    /// Topic a filter matches, with any shared subscription prefix removed
    pub fn filter_topic(filter: &str) -> &str {
        match filter.strip_prefix(SHARED_PREFIX) {
            Some(rest) => rest.split_once('/').map_or(rest, |(_, topic)| topic),
            None => filter,
        }
    }

    /// Topic prefix shared by every reply inbox of a connection
    pub fn inbox_prefix(client_id: &str) -> String {
        format!("{INBOX_PREFIX}/{client_id}/")
    }

    /// Single broker filter covering every reply inbox of a connection
    pub fn inbox_filter(client_id: &str) -> String {
        format!("{}#", Self::inbox_prefix(client_id))
    }

    /// Fresh reply inbox for a connection
    pub fn build_inbox(client_id: &str) -> String {
        format!(
            "{}{}",
            Self::inbox_prefix(client_id),
            uuid::Uuid::new_v4().simple()
        )
    }
}
