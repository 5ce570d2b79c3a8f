//! Connection definitions for the connectivity core.
//!
//! A connection describes one external endpoint: its type, URI, optional
//! signing credentials, outbound targets and inbound sources. Connections are
//! immutable value objects; modifying a connection replaces it wholesale.
//!
//! # Identification
//! Connections are uniquely identified by a free-form non-empty id. Targets
//! and sources are addressed by their position within the connection.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::credentials::HmacCredentials;
use crate::error::Error;

/// Unique identifier of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::config_invalid("connection id must not be empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// Supported connection types.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ConnectionType {
    #[serde(rename = "http-push")]
    #[strum(serialize = "http-push")]
    HttpPush,
    #[serde(rename = "kafka")]
    #[strum(serialize = "kafka")]
    Kafka,
    #[serde(rename = "amqp-091")]
    #[strum(serialize = "amqp-091")]
    Amqp091,
    #[serde(rename = "amqp-10")]
    #[strum(serialize = "amqp-10")]
    Amqp10,
    #[serde(rename = "mqtt")]
    #[strum(serialize = "mqtt")]
    Mqtt,
    #[serde(rename = "mqtt-5")]
    #[strum(serialize = "mqtt-5")]
    Mqtt5,
}

/// Lifecycle status of a connection.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionStatus {
    Open,
    Closed,
    Failed,
}

/// Signal categories a target can subscribe to.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    LiveMessages,
    LiveCommands,
    LiveEvents,
    TwinEvents,
}

/// An outbound publication target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Address template, `METHOD:path?query#fragment` for HTTP push.
    #[builder(into)]
    pub address: String,

    /// Authorization subjects the target publishes under.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub authorization_context: Vec<String>,

    /// Header name to rendered-template mapping applied per publication.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    pub header_mapping: BTreeMap<String, String>,

    /// Acknowledgement label this target issues for successful publications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub issued_acknowledgement_label: Option<String>,

    /// Signal categories routed to this target.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    #[builder(default)]
    pub topics: HashSet<Topic>,
}

/// An inbound consumption source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Addresses polled by this source, in declaration order.
    #[builder(default)]
    pub addresses: Vec<String>,

    /// Authorization subjects inbound messages are attributed to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub authorization_context: Vec<String>,

    /// Delivery quality of service: 0 = at-most-once, 1 = at-least-once.
    #[serde(default)]
    #[builder(default)]
    pub qos: u8,

    /// Number of parallel consumers attached to each address.
    #[serde(default = "default_consumer_count")]
    #[builder(default = 1)]
    pub consumer_count: usize,
}

fn default_consumer_count() -> usize {
    1
}

/// An external endpoint definition.
///
/// Immutable once created; a modify operation replaces the whole object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,

    #[serde(rename = "connectionType")]
    pub connection_type: ConnectionType,

    #[builder(default = ConnectionStatus::Closed)]
    pub status: ConnectionStatus,

    /// Base URI of the endpoint.
    #[builder(into)]
    pub uri: String,

    /// Optional HMAC signing credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<HmacCredentials>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub targets: Vec<Target>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub sources: Vec<Source>,

    /// Free-form per-connection settings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    pub specific_config: BTreeMap<String, String>,
}

impl Connection {
    /// The acknowledgement status used when the transport fails.
    ///
    /// Override with the `transportFailureStatus` specific-config entry.
    pub fn transport_failure_status(&self) -> http::StatusCode {
        self.specific_config
            .get("transportFailureStatus")
            .and_then(|raw| raw.parse::<u16>().ok())
            .and_then(|code| http::StatusCode::from_u16(code).ok())
            .unwrap_or(http::StatusCode::BAD_GATEWAY)
    }

    /// Custom headers merged into every acknowledgement, from specific-config
    /// entries prefixed `ackHeader:`.
    pub fn ack_headers(&self) -> BTreeMap<String, String> {
        self.specific_config
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix("ackHeader:")
                    .map(|name| (name.to_owned(), value.clone()))
            })
            .collect()
    }
}
