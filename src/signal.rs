//! Signal and protocol-envelope types flowing through the connectivity core.
//!
//! The publisher consumes domain signals (live messages, events) together with
//! their protocol-adaptable wire form. Protocol adaptation itself is a pure
//! codec; this module only defines the envelope and the signal types the
//! pipeline needs for rendering, correlation and acknowledgement.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Content type of protocol envelopes travelling over HTTP.
pub const PROTOCOL_CONTENT_TYPE: &str = "application/vnd.outpost+json";

/// Header carrying the correlation id of a command or response.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// Header listing the acknowledgement labels a signal requests.
pub const REQUESTED_ACKS_HEADER: &str = "requested-acks";

/// Parses a `requested-acks` header value: either a JSON array of strings or
/// a comma separated list.
pub fn parse_requested_acks(headers: &BTreeMap<String, String>) -> Vec<String> {
    let Some(raw) = headers.get(REQUESTED_ACKS_HEADER) else {
        return Vec::new();
    };

    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
        return items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
    }

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Namespaced entity identifier in `namespace:name` form.
///
/// The namespace is everything before the first `:`; the name may itself
/// contain further colons.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    namespace: String,
    name: String,
}

impl EntityId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .split_once(':')
            .ok_or_else(|| Error::config_invalid(format!("entity id without namespace: {s:?}")))?;
        if name.is_empty() {
            return Err(Error::config_invalid(format!("entity id without name: {s:?}")));
        }
        Ok(Self::new(namespace, name))
    }
}

impl TryFrom<String> for EntityId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_string()
    }
}

/// Parsed protocol topic path, e.g. `org.example/sensor-1/things/live/messages/ask`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolTopic {
    pub namespace: String,
    pub entity_name: String,
    pub group: String,
    pub channel: String,
    pub criterion: String,
    pub action: Option<String>,
}

impl ProtocolTopic {
    pub fn live_message(entity: &EntityId, subject: &str) -> Self {
        Self {
            namespace: entity.namespace().to_owned(),
            entity_name: entity.name().to_owned(),
            group: "things".to_owned(),
            channel: "live".to_owned(),
            criterion: "messages".to_owned(),
            action: Some(subject.to_owned()),
        }
    }

    pub fn twin_event(entity: &EntityId, action: &str) -> Self {
        Self {
            namespace: entity.namespace().to_owned(),
            entity_name: entity.name().to_owned(),
            group: "things".to_owned(),
            channel: "twin".to_owned(),
            criterion: "events".to_owned(),
            action: Some(action.to_owned()),
        }
    }

    pub fn entity_id(&self) -> EntityId {
        EntityId::new(&self.namespace, &self.entity_name)
    }
}

impl fmt::Display for ProtocolTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.namespace, self.entity_name, self.group, self.channel, self.criterion
        )?;
        if let Some(action) = &self.action {
            write!(f, "/{action}")?;
        }
        Ok(())
    }
}

impl FromStr for ProtocolTopic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let (Some(namespace), Some(entity_name), Some(group), Some(channel), Some(criterion)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(Error::config_invalid(format!("malformed topic path: {s:?}")));
        };

        Ok(Self {
            namespace: namespace.to_owned(),
            entity_name: entity_name.to_owned(),
            group: group.to_owned(),
            channel: channel.to_owned(),
            criterion: criterion.to_owned(),
            action: {
                let rest = parts.collect::<Vec<_>>().join("/");
                (!rest.is_empty()).then_some(rest)
            },
        })
    }
}

/// Protocol-adaptable wire envelope.
///
/// The JSON form carried over HTTP bodies: `topic`, `headers`, `path`,
/// optional `status` (responses only) and optional `value`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adaptable {
    pub topic: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Adaptable {
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_ID_HEADER).map(String::as_str)
    }

    pub fn topic(&self) -> Result<ProtocolTopic, Error> {
        self.topic.parse()
    }
}

/// A live message command addressed to a thing or one of its features.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageCommand {
    pub thing_id: EntityId,
    pub feature_id: Option<String>,
    pub subject: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Option<Value>,
}

impl MessageCommand {
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_ID_HEADER).map(String::as_str)
    }

    /// Raw acknowledgement labels requested by the sender.
    pub fn requested_acks(&self) -> Vec<String> {
        parse_requested_acks(&self.headers)
    }

    pub fn type_name(&self) -> &'static str {
        if self.feature_id.is_some() {
            "messages.commands:featureMessage"
        } else {
            "messages.commands:thingMessage"
        }
    }

    /// The response type a correlated live response must carry.
    pub fn expected_response_type(&self) -> &'static str {
        if self.feature_id.is_some() {
            "messages.responses:featureResponseMessage"
        } else {
            "messages.responses:thingResponseMessage"
        }
    }

    fn message_path(feature_id: Option<&str>, subject: &str) -> String {
        match feature_id {
            Some(feature) => format!("/features/{feature}/inbox/messages/{subject}"),
            None => format!("/inbox/messages/{subject}"),
        }
    }

    pub fn to_adaptable(&self) -> Adaptable {
        Adaptable {
            topic: ProtocolTopic::live_message(&self.thing_id, &self.subject).to_string(),
            headers: self.headers.clone(),
            path: Self::message_path(self.feature_id.as_deref(), &self.subject),
            status: None,
            value: self.payload.clone(),
        }
    }
}

/// A live message response correlated to a [`MessageCommand`].
#[derive(Clone, Debug, PartialEq)]
pub struct MessageResponse {
    pub thing_id: EntityId,
    pub feature_id: Option<String>,
    pub subject: String,
    pub status: StatusCode,
    pub headers: BTreeMap<String, String>,
    pub value: Option<Value>,
}

impl MessageResponse {
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_ID_HEADER).map(String::as_str)
    }

    pub fn type_name(&self) -> &'static str {
        if self.feature_id.is_some() {
            "messages.responses:featureResponseMessage"
        } else {
            "messages.responses:thingResponseMessage"
        }
    }

    /// Parses a response envelope received over a live channel.
    ///
    /// The topic must address the live messages criterion and carry a status.
    pub fn from_adaptable(adaptable: &Adaptable) -> Result<Self, Error> {
        let topic = adaptable.topic()?;
        if topic.channel != "live" || topic.criterion != "messages" {
            return Err(Error::config_invalid(format!(
                "not a live message topic: {}",
                adaptable.topic
            )));
        }

        let status = adaptable
            .status
            .ok_or_else(|| Error::config_invalid("live response without status"))
            .and_then(|code| {
                StatusCode::from_u16(code)
                    .map_err(|_| Error::config_invalid(format!("invalid response status {code}")))
            })?;

        let subject = topic
            .action
            .clone()
            .ok_or_else(|| Error::config_invalid("live message topic without subject"))?;

        Ok(Self {
            thing_id: topic.entity_id(),
            feature_id: parse_feature_path(&adaptable.path),
            subject,
            status,
            headers: adaptable.headers.clone(),
            value: adaptable.value.clone(),
        })
    }

    pub fn to_adaptable(&self) -> Adaptable {
        let path = match &self.feature_id {
            Some(feature) => format!("/features/{feature}/outbox/messages/{}", self.subject),
            None => format!("/outbox/messages/{}", self.subject),
        };

        Adaptable {
            topic: ProtocolTopic::live_message(&self.thing_id, &self.subject).to_string(),
            headers: self.headers.clone(),
            path,
            status: Some(self.status.as_u16()),
            value: self.value.clone(),
        }
    }
}

fn parse_feature_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/features/")?;
    let (feature, _) = rest.split_once('/')?;
    Some(feature.to_owned())
}

/// An event emitted by the twin or live channel of a thing.
#[derive(Clone, Debug, PartialEq)]
pub struct EventSignal {
    pub thing_id: EntityId,
    pub action: String,
    pub channel: String,
    pub headers: BTreeMap<String, String>,
    pub value: Option<Value>,
}

/// A signal the outbound pipeline can publish.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    Message(MessageCommand),
    Event(EventSignal),
}

impl Signal {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::Message(command) => &command.thing_id,
            Self::Event(event) => &event.thing_id,
        }
    }

    pub fn feature_id(&self) -> Option<&str> {
        match self {
            Self::Message(command) => command.feature_id.as_deref(),
            Self::Event(_) => None,
        }
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Message(command) => &command.headers,
            Self::Event(event) => &event.headers,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers().get(CORRELATION_ID_HEADER).map(String::as_str)
    }

    pub fn topic(&self) -> ProtocolTopic {
        match self {
            Self::Message(command) => {
                ProtocolTopic::live_message(&command.thing_id, &command.subject)
            }
            Self::Event(event) => ProtocolTopic {
                namespace: event.thing_id.namespace().to_owned(),
                entity_name: event.thing_id.name().to_owned(),
                group: "things".to_owned(),
                channel: event.channel.clone(),
                criterion: "events".to_owned(),
                action: Some(event.action.clone()),
            },
        }
    }
}
