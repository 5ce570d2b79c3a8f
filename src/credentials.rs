//! HMAC request-signing credentials.
//!
//! Credentials travel as `{ "algorithm": …, "parameters": { … } }` JSON
//! attached to a connection. The parameter mapping is algorithm specific and
//! validated when the signer is built, at open/modify time.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Algorithm tag of the AWS Signature Version 4 signer.
pub const ALGORITHM_AWS4: &str = "aws4-hmac-sha256";
/// Algorithm tag of the Azure Monitor Data Collector signer.
pub const ALGORITHM_AZ_MONITOR: &str = "az-monitor-2016-04-01";

/// HMAC credentials envelope: algorithm tag plus parameter mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HmacCredentials {
    pub algorithm: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl HmacCredentials {
    pub fn new(algorithm: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            algorithm: algorithm.into(),
            parameters,
        }
    }
}

fn required_str(parameters: &Map<String, Value>, name: &'static str) -> Result<String, Error> {
    parameters
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::credentials_invalid(format!("missing required parameter {name:?}")))
}

/// Parameters of the AWS SigV4 signer.
#[derive(Clone, Debug)]
pub struct Aws4Params {
    pub region: String,
    pub service: String,
    pub access_key: String,
    pub secret_key: SecretString,
    /// Percent-encode the path a second time, as most AWS services expect.
    pub double_encode: bool,
    /// Headers included in the canonical request, lower-cased, in order.
    pub canonical_headers: Vec<String>,
}

impl Aws4Params {
    pub fn from_parameters(parameters: &Map<String, Value>) -> Result<Self, Error> {
        let double_encode = match parameters.get("doubleEncode") {
            None => true,
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(Error::credentials_invalid(format!(
                    "doubleEncode must be a boolean, got {other}"
                )))
            }
        };

        let canonical_headers = match parameters.get("canonicalHeaders") {
            None => vec!["x-amz-date".to_owned(), "host".to_owned()],
            Some(Value::Array(items)) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    let name = item.as_str().ok_or_else(|| {
                        Error::credentials_invalid("canonicalHeaders must contain strings")
                    })?;
                    names.push(name.to_ascii_lowercase());
                }
                if names.is_empty() {
                    return Err(Error::credentials_invalid(
                        "canonicalHeaders must not be empty",
                    ));
                }
                names
            }
            Some(other) => {
                return Err(Error::credentials_invalid(format!(
                    "canonicalHeaders must be an array, got {other}"
                )))
            }
        };

        Ok(Self {
            region: required_str(parameters, "region")?,
            service: required_str(parameters, "service")?,
            access_key: required_str(parameters, "accessKey")?,
            secret_key: SecretString::from(required_str(parameters, "secretKey")?),
            double_encode,
            canonical_headers,
        })
    }
}

/// Parameters of the Azure Monitor signer.
#[derive(Clone, Debug)]
pub struct AzMonitorParams {
    pub workspace_id: String,
    /// Base64 encoded shared key of the workspace.
    pub shared_key: SecretString,
}

impl AzMonitorParams {
    pub fn from_parameters(parameters: &Map<String, Value>) -> Result<Self, Error> {
        Ok(Self {
            workspace_id: required_str(parameters, "workspaceId")?,
            shared_key: SecretString::from(required_str(parameters, "sharedKey")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn aws4_defaults_apply() {
        let credentials: HmacCredentials = serde_json::from_value(serde_json::json!({
            "algorithm": "aws4-hmac-sha256",
            "parameters": {
                "region": "us-east-1",
                "service": "iotdata",
                "accessKey": "AKIDEXAMPLE",
                "secretKey": "wJalrXUtnFEMI",
            }
        }))
        .unwrap();

        let params = Aws4Params::from_parameters(&credentials.parameters).unwrap();
        assert!(params.double_encode);
        assert_eq!(params.canonical_headers, vec!["x-amz-date", "host"]);
        assert_eq!(params.secret_key.expose_secret(), "wJalrXUtnFEMI");
    }

    #[test]
    fn aws4_missing_parameter_is_rejected() {
        let parameters = serde_json::json!({
            "region": "us-east-1",
            "service": "iotdata",
            "accessKey": "AKIDEXAMPLE",
        });
        let Value::Object(parameters) = parameters else {
            unreachable!()
        };

        let err = Aws4Params::from_parameters(&parameters).unwrap_err();
        assert!(err.to_string().contains("secretKey"), "{err}");
    }

    #[test]
    fn canonical_headers_are_lowercased() {
        let parameters = serde_json::json!({
            "region": "us-east-1",
            "service": "iotdata",
            "accessKey": "AKIDEXAMPLE",
            "secretKey": "wJalrXUtnFEMI",
            "canonicalHeaders": ["X-Amz-Date", "Host", "Content-Type"],
        });
        let Value::Object(parameters) = parameters else {
            unreachable!()
        };

        let params = Aws4Params::from_parameters(&parameters).unwrap();
        assert_eq!(
            params.canonical_headers,
            vec!["x-amz-date", "host", "content-type"]
        );
    }

    #[test]
    fn az_monitor_requires_workspace_and_key() {
        let parameters = serde_json::json!({ "workspaceId": "ws-1" });
        let Value::Object(parameters) = parameters else {
            unreachable!()
        };

        assert!(AzMonitorParams::from_parameters(&parameters).is_err());
    }
}
