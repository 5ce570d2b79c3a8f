//! Request signing for outbound HTTP publications.
//!
//! A signer is a pure function from an unsigned request and a timestamp to a
//! signed request: no I/O, no retries, and byte-identical output for identical
//! inputs. Signers are stateless and safely shared across the publisher's
//! dispatch workers.
//!
//! Algorithms are resolved through a registry populated at build time; an
//! unknown algorithm tag is a credentials error surfaced at connection
//! open/modify time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::credentials::{HmacCredentials, ALGORITHM_AWS4, ALGORITHM_AZ_MONITOR};
use crate::error::Error;
use crate::external::HttpRequest;

pub mod aws4;
pub mod az_monitor;

/// Signs outbound requests with connection credentials.
pub trait RequestSigner: Send + Sync {
    /// Returns a signed copy of `request`.
    ///
    /// Deterministic: the same request and timestamp always produce the same
    /// signed request.
    fn sign(&self, request: &HttpRequest, at: DateTime<Utc>) -> Result<HttpRequest, Error>;
}

type SignerFactory = fn(&Map<String, Value>) -> Result<Arc<dyn RequestSigner>, Error>;

const REGISTRY: &[(&str, SignerFactory)] = &[
    (ALGORITHM_AWS4, aws4::factory),
    (ALGORITHM_AZ_MONITOR, az_monitor::factory),
];

/// Builds the signer for the given credentials.
///
/// Validates the algorithm tag and the parameter mapping; both failure modes
/// are [`Error::CredentialsInvalid`].
pub fn signer_for(credentials: &HmacCredentials) -> Result<Arc<dyn RequestSigner>, Error> {
    let factory = REGISTRY
        .iter()
        .find(|(alias, _)| *alias == credentials.algorithm)
        .map(|(_, factory)| factory)
        .ok_or_else(|| {
            Error::credentials_invalid(format!("unknown algorithm {:?}", credentials.algorithm))
        })?;

    factory(&credentials.parameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_algorithm_is_rejected() {
        let credentials = HmacCredentials::new("hmac-md5", Map::new());
        let err = match signer_for(&credentials) {
            Err(err) => err,
            Ok(_) => panic!("expected unknown algorithm to be rejected"),
        };
        assert!(matches!(err, Error::CredentialsInvalid { .. }), "{err}");
    }

    #[test]
    fn known_algorithms_resolve() {
        let parameters = serde_json::json!({
            "region": "us-east-1",
            "service": "service",
            "accessKey": "AKIDEXAMPLE",
            "secretKey": "secret",
        });
        let Value::Object(parameters) = parameters else {
            unreachable!()
        };
        assert!(signer_for(&HmacCredentials::new(ALGORITHM_AWS4, parameters)).is_ok());

        let parameters = serde_json::json!({
            "workspaceId": "ws-1",
            "sharedKey": "c2VjcmV0",
        });
        let Value::Object(parameters) = parameters else {
            unreachable!()
        };
        assert!(signer_for(&HmacCredentials::new(ALGORITHM_AZ_MONITOR, parameters)).is_ok());
    }
}
