//! AWS Signature Version 4 request signing.
//!
//! Implements the SigV4 signing process for outbound requests:
//! 1. Creating a canonical request from the HTTP request
//! 2. Creating a string to sign using the canonical request
//! 3. Deriving the signing key by chained HMAC-SHA256
//! 4. Attaching the `Authorization` header with the computed signature
//!
//! For more details, see [AWS Signature Version 4 signing process](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use itertools::Itertools;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use urlencoding::encode as uri_encode;

use crate::credentials::Aws4Params;
use crate::error::Error;
use crate::external::HttpRequest;

use super::RequestSigner;

const LONG_DATETIME_FMT: &str = "%Y%m%dT%H%M%SZ";
const SHORT_DATE_FMT: &str = "%Y%m%d";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

type HmacSha256 = Hmac<Sha256>;

pub(super) fn factory(parameters: &Map<String, Value>) -> Result<Arc<dyn RequestSigner>, Error> {
    Ok(Arc::new(Aws4Signer {
        params: Aws4Params::from_parameters(parameters)?,
    }))
}

/// SigV4 signer configured from connection credentials.
pub struct Aws4Signer {
    params: Aws4Params,
}

impl Aws4Signer {
    pub fn new(params: Aws4Params) -> Self {
        Self { params }
    }
}

impl RequestSigner for Aws4Signer {
    fn sign(&self, request: &HttpRequest, at: DateTime<Utc>) -> Result<HttpRequest, Error> {
        let amz_date = at.format(LONG_DATETIME_FMT).to_string();
        let short_date = at.format(SHORT_DATE_FMT).to_string();

        let mut signed = request.clone();
        signed.set_header("x-amz-date", &amz_date);

        let canonical_request = canonical_request(&signed, &self.params)?;

        let scope = format!(
            "{short_date}/{}/{}/aws4_request",
            self.params.region, self.params.service
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let key = signing_key(
            self.params.secret_key.expose_secret(),
            &short_date,
            &self.params.region,
            &self.params.service,
        )?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        signed.append_header(
            "Authorization",
            format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={}, Signature={signature}",
                self.params.access_key,
                signed_headers(&self.params),
            ),
        );

        Ok(signed)
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::credentials_invalid(format!("invalid HMAC key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Chained signing key: secret -> date -> region -> service -> "aws4_request".
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, Error> {
    let k_secret = format!("AWS4{secret}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// Canonical URI component.
///
/// The `Url` path is already percent-encoded once; `doubleEncode` applies one
/// further pass per segment, leaving the separating slashes alone.
fn canonical_uri(request: &HttpRequest, params: &Aws4Params) -> String {
    let path = request.uri.path();
    if !params.double_encode {
        return path.to_owned();
    }

    path.split('/')
        .map(|segment| uri_encode(segment).into_owned())
        .join("/")
}

/// Canonical query string: pairs sorted by name, then value, RFC3986 encoded.
fn canonical_query(request: &HttpRequest) -> String {
    let mut pairs: Vec<(String, String)> = request
        .uri
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k).into_owned(), uri_encode(&v).into_owned()))
        .collect();
    pairs.sort();

    pairs.iter().map(|(k, v)| format!("{k}={v}")).join("&")
}

fn host_value(request: &HttpRequest) -> Result<String, Error> {
    if let Some(host) = request.header("host") {
        return Ok(host.to_owned());
    }

    let host = request
        .uri
        .host_str()
        .ok_or_else(|| Error::credentials_invalid("request URI has no host to sign"))?;

    Ok(match request.uri.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

/// Canonical headers: the configured names in order, `name:trimmed-value\n`.
fn canonical_headers(request: &HttpRequest, params: &Aws4Params) -> Result<String, Error> {
    let mut out = String::new();
    for name in &params.canonical_headers {
        let value = if name == "host" && request.header("host").is_none() {
            host_value(request)?
        } else {
            request
                .header(name)
                .ok_or_else(|| {
                    Error::credentials_invalid(format!("canonical header {name:?} missing"))
                })?
                .to_owned()
        };
        out.push_str(name);
        out.push(':');
        out.push_str(value.trim());
        out.push('\n');
    }
    Ok(out)
}

fn signed_headers(params: &Aws4Params) -> String {
    params.canonical_headers.join(";")
}

fn canonical_request(request: &HttpRequest, params: &Aws4Params) -> Result<String, Error> {
    Ok(format!(
        "{method}\n{uri}\n{query}\n{headers}\n{signed}\n{payload}",
        method = request.method.as_str(),
        uri = canonical_uri(request, params),
        query = canonical_query(request),
        headers = canonical_headers(request, params)?,
        signed = signed_headers(params),
        payload = sha256_hex(&request.body),
    ))
}

#[cfg(test)]
mod tests {
    use http::Method;
    use secrecy::SecretString;
    use url::Url;

    use super::*;

    /// Official SigV4 test-suite credentials ("get-vanilla" case).
    fn test_params() -> Aws4Params {
        Aws4Params {
            region: "us-east-1".to_owned(),
            service: "service".to_owned(),
            access_key: "AKIDEXAMPLE".to_owned(),
            secret_key: SecretString::from("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"),
            double_encode: true,
            canonical_headers: vec!["host".to_owned(), "x-amz-date".to_owned()],
        }
    }

    fn test_timestamp() -> DateTime<Utc> {
        chrono::DateTime::parse_from_rfc3339("2015-08-30T12:36:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn get_vanilla_matches_published_signature() {
        let signer = Aws4Signer::new(test_params());
        let request = HttpRequest::new(
            Method::GET,
            Url::parse("https://example.amazonaws.com").unwrap(),
        );

        let signed = signer.sign(&request, test_timestamp()).unwrap();

        assert_eq!(signed.header("x-amz-date"), Some("20150830T123600Z"));
        assert_eq!(
            signed.header("authorization"),
            Some(
                "AWS4-HMAC-SHA256 \
                 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
                 SignedHeaders=host;x-amz-date, \
                 Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
            )
        );
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = Aws4Signer::new(test_params());
        let mut request = HttpRequest::new(
            Method::POST,
            Url::parse("https://example.amazonaws.com/devices/sensor-1?b=2&a=1").unwrap(),
        );
        request.body = bytes::Bytes::from_static(b"{\"temp\":21}");

        let at = test_timestamp();
        let first = signer.sign(&request, at).unwrap();
        let second = signer.sign(&request, at).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn canonical_query_sorts_by_name_then_value() {
        let request = HttpRequest::new(
            Method::GET,
            Url::parse("https://example.amazonaws.com/?b=x&a=2&a=1").unwrap(),
        );

        assert_eq!(canonical_query(&request), "a=1&a=2&b=x");
    }

    #[test]
    fn double_encoding_is_applied_per_segment() {
        let params = test_params();
        let request = HttpRequest::new(
            Method::GET,
            Url::parse("https://example.amazonaws.com/a b/c").unwrap(),
        );

        // Url stores the path singly encoded as /a%20b/c.
        assert_eq!(canonical_uri(&request, &params), "/a%2520b/c");

        let params = Aws4Params {
            double_encode: false,
            ..params
        };
        assert_eq!(canonical_uri(&request, &params), "/a%20b/c");
    }

    #[test]
    fn host_falls_back_to_uri_authority() {
        let request = HttpRequest::new(
            Method::GET,
            Url::parse("https://example.amazonaws.com:8443/x").unwrap(),
        );

        assert_eq!(host_value(&request).unwrap(), "example.amazonaws.com:8443");
    }
}
