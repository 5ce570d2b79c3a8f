//! Per-connection-type transport validation.
//!
//! Applied when a connection is opened or modified; a connection that fails
//! validation is never handed to a publisher or consumer. All failures are
//! [`Error::ConnectionConfigurationInvalid`] naming the offending fragment.

use url::Url;

use crate::address::HttpPushAddress;
use crate::connection::{Connection, ConnectionType};
use crate::error::Error;
use crate::placeholder::Template;
use crate::signing;

/// Validates a connection definition against its type's transport rules.
pub fn validate(connection: &Connection) -> Result<(), Error> {
    if let Some(credentials) = &connection.credentials {
        // Builds and drops the signer; parameter errors surface here rather
        // than at first publish.
        signing::signer_for(credentials)?;
    }

    for target in &connection.targets {
        for (name, template) in &target.header_mapping {
            Template::parse(template).map_err(|e| {
                Error::config_invalid(format!("header mapping {name:?}: {e}"))
            })?;
        }
        if let Some(label) = &target.issued_acknowledgement_label {
            crate::acks::AckLabel::new(label.clone())?;
        }
    }

    match connection.connection_type {
        ConnectionType::HttpPush => validate_http_push(connection),
        ConnectionType::Kafka => validate_kafka(connection),
        ConnectionType::Mqtt | ConnectionType::Mqtt5 => validate_mqtt(connection),
        ConnectionType::Amqp091 | ConnectionType::Amqp10 => validate_amqp(connection),
    }
}

fn validate_http_push(connection: &Connection) -> Result<(), Error> {
    let uri = Url::parse(&connection.uri).map_err(|e| {
        Error::config_invalid(format!("connection URI {:?}: {e}", connection.uri))
    })?;

    if !matches!(uri.scheme(), "http" | "https") {
        return Err(Error::config_invalid(format!(
            "connection URI {:?}: scheme must be http or https",
            connection.uri
        )));
    }
    if uri.host_str().is_none() {
        return Err(Error::config_invalid(format!(
            "connection URI {:?}: missing host",
            connection.uri
        )));
    }

    if !connection.sources.is_empty() {
        return Err(Error::config_invalid(
            "sources are not supported for HTTP push connections",
        ));
    }

    if connection.targets.is_empty() {
        return Err(Error::config_invalid(
            "HTTP push connections need at least one target",
        ));
    }
    for target in &connection.targets {
        HttpPushAddress::parse(&target.address)
            .map_err(|e| Error::config_invalid(format!("target {:?}: {e}", target.address)))?;
    }

    Ok(())
}

fn validate_kafka(connection: &Connection) -> Result<(), Error> {
    if connection.targets.is_empty() && connection.sources.is_empty() {
        return Err(Error::config_invalid(
            "Kafka connections need at least one source or target",
        ));
    }

    for target in &connection.targets {
        if target.address.is_empty() {
            return Err(Error::config_invalid("target address must not be empty"));
        }
    }
    for source in &connection.sources {
        if source.addresses.iter().any(String::is_empty) {
            return Err(Error::config_invalid("source address must not be empty"));
        }
    }

    Ok(())
}

fn validate_mqtt(connection: &Connection) -> Result<(), Error> {
    for target in &connection.targets {
        if target.address.is_empty() {
            return Err(Error::config_invalid("target address must not be empty"));
        }
        if target.address.contains(['+', '#']) {
            return Err(Error::config_invalid(format!(
                "target {:?}: wildcards are not allowed in publish topics",
                target.address
            )));
        }
    }

    for source in &connection.sources {
        if source.addresses.iter().any(String::is_empty) {
            return Err(Error::config_invalid("source address must not be empty"));
        }
        if source.qos > 2 {
            return Err(Error::config_invalid(format!(
                "source qos must be 0, 1 or 2, got {}",
                source.qos
            )));
        }
    }

    Ok(())
}

fn validate_amqp(connection: &Connection) -> Result<(), Error> {
    for target in &connection.targets {
        if target.address.is_empty() {
            return Err(Error::config_invalid("target address must not be empty"));
        }
    }
    for source in &connection.sources {
        if source.addresses.iter().any(String::is_empty) {
            return Err(Error::config_invalid("source address must not be empty"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::connection::{ConnectionId, Source, Target, Topic};

    fn http_push(targets: Vec<Target>, sources: Vec<Source>) -> Connection {
        Connection::builder()
            .id(ConnectionId::new("org.example:http-1").unwrap())
            .connection_type(ConnectionType::HttpPush)
            .uri("https://example.org:8080")
            .targets(targets)
            .sources(sources)
            .build()
    }

    fn target(address: &str) -> Target {
        Target::builder()
            .address(address)
            .topics(HashSet::from([Topic::LiveMessages]))
            .build()
    }

    #[test]
    fn valid_http_push_target() {
        let connection = http_push(
            vec![target("PATCH:/x/{{thing:namespace}}/{{thing:name}}")],
            vec![],
        );
        assert!(validate(&connection).is_ok());
    }

    #[test]
    fn delete_target_is_rejected() {
        let connection = http_push(vec![target("DELETE:/x")], vec![]);
        let err = validate(&connection).unwrap_err();
        assert!(
            matches!(err, Error::ConnectionConfigurationInvalid { .. }),
            "{err}"
        );
    }

    #[test]
    fn empty_target_is_rejected() {
        let connection = http_push(vec![target("")], vec![]);
        assert!(validate(&connection).is_err());
    }

    #[test]
    fn http_push_rejects_sources() {
        let connection = http_push(
            vec![target("POST:/x")],
            vec![Source::builder().addresses(vec!["inbox".to_owned()]).build()],
        );
        let err = validate(&connection).unwrap_err();
        assert!(err.to_string().contains("sources"), "{err}");
    }

    #[test]
    fn http_push_requires_host() {
        let mut connection = http_push(vec![target("POST:/x")], vec![]);
        connection.uri = "not a uri".to_owned();
        assert!(validate(&connection).is_err());

        connection.uri = "unix:/var/run/socket".to_owned();
        assert!(validate(&connection).is_err());
    }

    #[test]
    fn invalid_credentials_fail_validation() {
        let mut connection = http_push(vec![target("POST:/x")], vec![]);
        connection.credentials = Some(crate::credentials::HmacCredentials::new(
            "unknown-algo",
            serde_json::Map::new(),
        ));
        let err = validate(&connection).unwrap_err();
        assert!(matches!(err, Error::CredentialsInvalid { .. }), "{err}");
    }

    #[test]
    fn mqtt_wildcard_target_is_rejected() {
        let connection = Connection::builder()
            .id(ConnectionId::new("org.example:mqtt-1").unwrap())
            .connection_type(ConnectionType::Mqtt)
            .uri("tcp://broker:1883")
            .targets(vec![target("telemetry/#")])
            .build();
        assert!(validate(&connection).is_err());
    }

    #[test]
    fn bad_header_mapping_template_is_rejected() {
        let mut bad = target("POST:/x");
        bad.header_mapping
            .insert("x-device".to_owned(), "{{ thing:name".to_owned());
        let connection = http_push(vec![bad], vec![]);
        assert!(validate(&connection).is_err());
    }
}
