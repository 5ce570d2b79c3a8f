//! Azure Monitor Data Collector request signing.
//!
//! Signs requests for the Log Analytics HTTP Data Collector API: an
//! `x-ms-date` header in RFC1123 form plus a `SharedKey` authorization built
//! from an HMAC-SHA256 over verb, content length, content type, date and the
//! resource path.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::credentials::AzMonitorParams;
use crate::error::Error;
use crate::external::HttpRequest;

use super::RequestSigner;

const RFC1123_FMT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub(super) fn factory(parameters: &Map<String, Value>) -> Result<Arc<dyn RequestSigner>, Error> {
    Ok(Arc::new(AzMonitorSigner {
        params: AzMonitorParams::from_parameters(parameters)?,
    }))
}

/// Azure Monitor signer configured from connection credentials.
pub struct AzMonitorSigner {
    params: AzMonitorParams,
}

impl AzMonitorSigner {
    pub fn new(params: AzMonitorParams) -> Self {
        Self { params }
    }
}

impl RequestSigner for AzMonitorSigner {
    fn sign(&self, request: &HttpRequest, at: DateTime<Utc>) -> Result<HttpRequest, Error> {
        let x_ms_date = at.format(RFC1123_FMT).to_string();

        let mut signed = request.clone();
        signed.set_header("x-ms-date", &x_ms_date);

        let to_sign = string_to_sign(&signed, &x_ms_date);

        let key = base64::engine::general_purpose::STANDARD
            .decode(self.params.shared_key.expose_secret())
            .map_err(|e| Error::credentials_invalid(format!("sharedKey is not base64: {e}")))?;

        let mut mac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|e| Error::credentials_invalid(format!("invalid HMAC key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        signed.append_header(
            "Authorization",
            format!("SharedKey {}:{signature}", self.params.workspace_id),
        );

        Ok(signed)
    }
}

fn string_to_sign(request: &HttpRequest, x_ms_date: &str) -> String {
    format!(
        "{verb}\n{length}\n{content_type}\nx-ms-date:{x_ms_date}\n{path}",
        verb = request.method.as_str(),
        length = request.body.len(),
        content_type = request.content_type().unwrap_or_default(),
        path = request.uri.path(),
    )
}
