//! Acknowledgement labels, envelopes and aggregates.
//!
//! A publication can request any number of acknowledgements, identified by
//! label. The publisher answers with a single aggregate containing exactly one
//! envelope per requested label; labels the endpoint never answered are filled
//! with timeout envelopes.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::signal::EntityId;

/// Label of the implicit acknowledgement satisfied by a live response.
pub const LIVE_RESPONSE_LABEL: &str = "live-response";

/// A validated acknowledgement label, e.g. `live-response` or `ns:custom`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AckLabel(String);

impl AckLabel {
    pub fn new(label: impl Into<String>) -> Result<Self, Error> {
        let label = label.into();
        if label.is_empty() || label.len() > 100 {
            return Err(Error::config_invalid(format!(
                "acknowledgement label must be 1..=100 characters: {label:?}"
            )));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
        {
            return Err(Error::config_invalid(format!(
                "acknowledgement label contains invalid characters: {label:?}"
            )));
        }
        Ok(Self(label))
    }

    pub fn live_response() -> Self {
        Self(LIVE_RESPONSE_LABEL.to_owned())
    }

    pub fn is_live_response(&self) -> bool {
        self.0 == LIVE_RESPONSE_LABEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AckLabel {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<AckLabel> for String {
    fn from(label: AckLabel) -> Self {
        label.0
    }
}

mod status_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(status: &StatusCode, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u16(status.as_u16())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<StatusCode, D::Error> {
        let code = u16::deserialize(de)?;
        StatusCode::from_u16(code).map_err(serde::de::Error::custom)
    }
}

/// One acknowledgement envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub label: AckLabel,
    pub entity_id: EntityId,
    #[serde(with = "status_serde")]
    pub status: StatusCode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Value>,
}

impl Acknowledgement {
    pub fn new(label: AckLabel, entity_id: EntityId, status: StatusCode) -> Self {
        Self {
            label,
            entity_id,
            status,
            headers: BTreeMap::new(),
            entity: None,
        }
    }

    pub fn with_entity(mut self, entity: Option<Value>) -> Self {
        self.entity = entity;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Fill-in envelope for a label whose deadline elapsed.
    pub fn timeout(label: AckLabel, entity_id: EntityId) -> Self {
        Self::new(label, entity_id, StatusCode::REQUEST_TIMEOUT).with_entity(Some(
            serde_json::json!({
                "status": StatusCode::REQUEST_TIMEOUT.as_u16(),
                "message": "No acknowledgement received within the configured timeout.",
            }),
        ))
    }

    pub fn is_successful(&self) -> bool {
        !self.status.is_client_error() && !self.status.is_server_error()
    }
}

/// Aggregate of acknowledgements for one publication, keyed uniquely by label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgements {
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    items: BTreeMap<AckLabel, Acknowledgement>,
}

impl Acknowledgements {
    pub fn new(entity_id: EntityId, correlation_id: Option<String>) -> Self {
        Self {
            entity_id,
            correlation_id,
            items: BTreeMap::new(),
        }
    }

    /// Inserts an envelope; a later envelope for the same label replaces the
    /// earlier one.
    pub fn insert(&mut self, ack: Acknowledgement) {
        self.items.insert(ack.label.clone(), ack);
    }

    pub fn contains(&self, label: &AckLabel) -> bool {
        self.items.contains_key(label)
    }

    pub fn get(&self, label: &AckLabel) -> Option<&Acknowledgement> {
        self.items.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Acknowledgement> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Aggregate status: the numerically highest child status.
    ///
    /// Error codes are numerically higher than success codes, so any failed
    /// child dominates the aggregate.
    pub fn status(&self) -> StatusCode {
        self.items
            .values()
            .map(|ack| ack.status)
            .max()
            .unwrap_or(StatusCode::OK)
    }

    pub fn is_successful(&self) -> bool {
        self.items.values().all(Acknowledgement::is_successful)
    }
}

/// Converts a response body into an acknowledgement entity.
///
/// JSON content types are parsed (falling back to the raw string on parse
/// failure), text bodies become JSON strings, and binary bodies become
/// base64-encoded JSON strings.
pub fn ack_entity(content_type: Option<&str>, body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }

    let media_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase());

    let is_json = media_type.as_deref().is_some_and(|mt| {
        mt == "application/json" || (mt.starts_with("application/vnd.") && mt.ends_with("+json"))
    });
    if is_json {
        return match serde_json::from_slice::<Value>(body) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(String::from_utf8_lossy(body).into_owned())),
        };
    }

    let is_text = media_type.as_deref().is_some_and(|mt| mt.starts_with("text/"));
    if is_text {
        return Some(Value::String(String::from_utf8_lossy(body).into_owned()));
    }

    if media_type.is_none() {
        if let Ok(text) = std::str::from_utf8(body) {
            return Some(Value::String(text.to_owned()));
        }
    }

    Some(Value::String(
        base64::engine::general_purpose::STANDARD.encode(body),
    ))
}
