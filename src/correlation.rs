//! Correlation of HTTP responses with their originating commands.
//!
//! For a live-message command the endpoint may answer with a protocol
//! envelope; the correlator validates correlation id, addressed thing and
//! response type before accepting it as the command's live response. Any other
//! response becomes a plain acknowledgement envelope.
//!
//! Correlation mismatches are not fatal: they yield a `BAD_REQUEST`
//! acknowledgement whose message names the mismatch.

use std::collections::BTreeMap;

use http::StatusCode;

use crate::acks::{ack_entity, Acknowledgement, AckLabel};
use crate::external::HttpResponse;
use crate::signal::{MessageCommand, MessageResponse, PROTOCOL_CONTENT_TYPE};

/// What a dispatched request produced for its originating command.
#[derive(Clone, Debug, PartialEq)]
pub enum CorrelationOutcome {
    /// A validated live response traversing back over this connection.
    LiveResponse(MessageResponse),
    /// A plain acknowledgement envelope.
    Ack(Acknowledgement),
}

impl CorrelationOutcome {
    /// The outcome as an envelope under the given label.
    pub fn into_ack(self, label: AckLabel) -> Acknowledgement {
        match self {
            Self::Ack(ack) => Acknowledgement { label, ..ack },
            Self::LiveResponse(response) => Acknowledgement::new(
                label,
                response.thing_id.clone(),
                response.status,
            )
            .with_headers(response.headers.clone())
            .with_entity(response.value),
        }
    }
}

/// Correlates `response` with the live-message command `command`.
///
/// `issued_label` is the target's issued acknowledgement label, if any;
/// `custom_headers` are merged into every produced envelope.
pub fn correlate_response(
    command: &MessageCommand,
    issued_label: Option<&AckLabel>,
    response: &HttpResponse,
    custom_headers: &BTreeMap<String, String>,
) -> CorrelationOutcome {
    let requests_live_response = command
        .requested_acks()
        .iter()
        .any(|label| label == crate::acks::LIVE_RESPONSE_LABEL);

    if requests_live_response && response.content_type() == Some(PROTOCOL_CONTENT_TYPE) {
        return correlate_live_response(command, response, custom_headers);
    }

    let label = issued_label.cloned().unwrap_or_else(AckLabel::live_response);

    let mut headers: BTreeMap<String, String> = response
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();
    headers.extend(custom_headers.clone());

    CorrelationOutcome::Ack(
        Acknowledgement::new(label, command.thing_id.clone(), response.status)
            .with_headers(headers)
            .with_entity(ack_entity(response.content_type(), &response.body)),
    )
}

fn correlate_live_response(
    command: &MessageCommand,
    response: &HttpResponse,
    custom_headers: &BTreeMap<String, String>,
) -> CorrelationOutcome {
    let parsed = crate::signal::Adaptable::from_json(&response.body)
        .and_then(|adaptable| MessageResponse::from_adaptable(&adaptable));

    let live = match parsed {
        Ok(live) => live,
        Err(e) => {
            return mismatch(
                command,
                format!("Live response is not a valid protocol message: {e}"),
                custom_headers,
            )
        }
    };

    let expected_correlation = command.correlation_id().unwrap_or_default();
    let actual_correlation = live.correlation_id().unwrap_or_default();
    if expected_correlation != actual_correlation {
        return mismatch(
            command,
            format!(
                "Correlation ID of response <{actual_correlation}> does not match \
                 correlation ID of message command <{expected_correlation}>"
            ),
            custom_headers,
        );
    }

    if live.thing_id != command.thing_id {
        return mismatch(
            command,
            format!(
                "Live response does not target the correct thing. Expected thing ID <{}>, \
                 but was <{}>.",
                command.thing_id, live.thing_id
            ),
            custom_headers,
        );
    }

    if live.type_name() != command.expected_response_type() {
        return mismatch(
            command,
            format!(
                "Live response of type <{}> is not of expected type <{}>.",
                live.type_name(),
                command.expected_response_type()
            ),
            custom_headers,
        );
    }

    CorrelationOutcome::LiveResponse(live)
}

fn mismatch(
    command: &MessageCommand,
    message: String,
    custom_headers: &BTreeMap<String, String>,
) -> CorrelationOutcome {
    let mut headers = custom_headers.clone();
    if let Some(correlation_id) = command.correlation_id() {
        headers.insert(
            crate::signal::CORRELATION_ID_HEADER.to_owned(),
            correlation_id.to_owned(),
        );
    }

    CorrelationOutcome::Ack(
        Acknowledgement::new(
            AckLabel::live_response(),
            command.thing_id.clone(),
            StatusCode::BAD_REQUEST,
        )
        .with_headers(headers)
        .with_entity(Some(serde_json::json!({
            "status": StatusCode::BAD_REQUEST.as_u16(),
            "message": message,
        }))),
    )
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::Value;

    use super::*;
    use crate::signal::{Adaptable, EntityId, CORRELATION_ID_HEADER, REQUESTED_ACKS_HEADER};

    fn command(requested_acks: &str) -> MessageCommand {
        MessageCommand {
            thing_id: EntityId::new("org.example", "sensor-1"),
            feature_id: None,
            subject: "ask".to_owned(),
            headers: BTreeMap::from([
                (CORRELATION_ID_HEADER.to_owned(), "cid".to_owned()),
                (REQUESTED_ACKS_HEADER.to_owned(), requested_acks.to_owned()),
            ]),
            payload: None,
        }
    }

    fn text_response(content_type: &str, body: &'static [u8]) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: vec![("content-type".to_owned(), content_type.to_owned())],
            body: Bytes::from_static(body),
        }
    }

    fn live_response_body(correlation_id: &str, thing: &str, feature: Option<&str>) -> Bytes {
        let path = match feature {
            Some(feature) => format!("/features/{feature}/outbox/messages/ask"),
            None => "/outbox/messages/ask".to_owned(),
        };
        let (namespace, name) = thing.split_once(':').unwrap();
        let adaptable = Adaptable {
            topic: format!("{namespace}/{name}/things/live/messages/ask"),
            headers: BTreeMap::from([(
                CORRELATION_ID_HEADER.to_owned(),
                correlation_id.to_owned(),
            )]),
            path,
            status: Some(200),
            value: Some(serde_json::json!("pong")),
        };
        Bytes::from(serde_json::to_vec(&adaptable).unwrap())
    }

    fn ack_message(outcome: &CorrelationOutcome) -> String {
        match outcome {
            CorrelationOutcome::Ack(ack) => ack
                .entity
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            CorrelationOutcome::LiveResponse(_) => panic!("expected an acknowledgement"),
        }
    }

    #[test]
    fn plain_text_response_becomes_ack() {
        let command = command("please-verify");
        let label = AckLabel::new("please-verify").unwrap();
        let outcome = correlate_response(
            &command,
            Some(&label),
            &text_response("text/plain", b"hello!"),
            &BTreeMap::new(),
        );

        let CorrelationOutcome::Ack(ack) = outcome else {
            panic!("expected ack");
        };
        assert_eq!(ack.label, label);
        assert_eq!(ack.status, StatusCode::OK);
        assert_eq!(ack.headers.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(ack.entity, Some(Value::String("hello!".to_owned())));
    }

    #[test]
    fn binary_response_is_base64_encoded() {
        let command = command("please-verify");
        let label = AckLabel::new("please-verify").unwrap();
        let outcome = correlate_response(
            &command,
            Some(&label),
            &text_response("application/octet-stream", b"hello!"),
            &BTreeMap::new(),
        );

        let CorrelationOutcome::Ack(ack) = outcome else {
            panic!("expected ack");
        };
        assert_eq!(ack.entity, Some(Value::String("aGVsbG8h".to_owned())));
        assert_eq!(
            ack.headers.get("content-type").map(String::as_str),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn valid_live_response_is_accepted() {
        let command = command("live-response");
        let response = HttpResponse {
            status: StatusCode::OK,
            headers: vec![("content-type".to_owned(), PROTOCOL_CONTENT_TYPE.to_owned())],
            body: live_response_body("cid", "org.example:sensor-1", None),
        };

        let outcome = correlate_response(&command, None, &response, &BTreeMap::new());
        let CorrelationOutcome::LiveResponse(live) = outcome else {
            panic!("expected live response");
        };
        assert_eq!(live.correlation_id(), Some("cid"));
        assert_eq!(live.type_name(), "messages.responses:thingResponseMessage");
    }

    #[test]
    fn correlation_id_mismatch_yields_bad_request() {
        let command = command("live-response");
        let response = HttpResponse {
            status: StatusCode::OK,
            headers: vec![("content-type".to_owned(), PROTOCOL_CONTENT_TYPE.to_owned())],
            body: live_response_body("otherID", "org.example:sensor-1", None),
        };

        let outcome = correlate_response(&command, None, &response, &BTreeMap::new());
        let CorrelationOutcome::Ack(ref ack) = outcome else {
            panic!("expected ack");
        };
        assert!(ack.label.is_live_response());
        assert_eq!(ack.status, StatusCode::BAD_REQUEST);
        assert!(ack_message(&outcome).contains(
            "Correlation ID of response <otherID> does not match correlation ID of \
             message command <cid>"
        ));
    }

    #[test]
    fn wrong_thing_yields_bad_request() {
        let command = command("live-response");
        let response = HttpResponse {
            status: StatusCode::OK,
            headers: vec![("content-type".to_owned(), PROTOCOL_CONTENT_TYPE.to_owned())],
            body: live_response_body("cid", "org.example:other-thing", None),
        };

        let outcome = correlate_response(&command, None, &response, &BTreeMap::new());
        assert!(ack_message(&outcome).contains(
            "Live response does not target the correct thing. Expected thing ID \
             <org.example:sensor-1>, but was <org.example:other-thing>."
        ));
    }

    #[test]
    fn wrong_response_type_yields_bad_request() {
        let command = command("live-response");
        let response = HttpResponse {
            status: StatusCode::OK,
            headers: vec![("content-type".to_owned(), PROTOCOL_CONTENT_TYPE.to_owned())],
            body: live_response_body("cid", "org.example:sensor-1", Some("lamp")),
        };

        let outcome = correlate_response(&command, None, &response, &BTreeMap::new());
        assert!(ack_message(&outcome).contains(
            "Live response of type <messages.responses:featureResponseMessage> is not of \
             expected type <messages.responses:thingResponseMessage>."
        ));
    }

    #[test]
    fn custom_headers_are_merged_into_acks() {
        let command = command("please-verify");
        let custom = BTreeMap::from([("x-origin".to_owned(), "outpost".to_owned())]);
        let outcome = correlate_response(
            &command,
            None,
            &text_response("text/plain", b"ok"),
            &custom,
        );

        let CorrelationOutcome::Ack(ack) = outcome else {
            panic!("expected ack");
        };
        assert_eq!(ack.headers.get("x-origin").map(String::as_str), Some("outpost"));
    }
}
