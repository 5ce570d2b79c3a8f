//! External message and outbound request representations.
//!
//! An external message is the transport-agnostic form a payload mapper
//! produces: a case-insensitive header map plus a text or byte payload. The
//! HTTP push pipeline turns it into an [`HttpRequest`]; reserved header keys
//! restructure the request instead of travelling as transport headers.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Reserved header key overriding the request method.
pub const RESERVED_HEADER_HTTP_METHOD: &str = "http.method";
/// Reserved header key replacing the URI path.
pub const RESERVED_HEADER_HTTP_PATH: &str = "http.path";
/// Reserved header key replacing the URI query string.
pub const RESERVED_HEADER_HTTP_QUERY: &str = "http.query";

/// Header map with case-insensitive keys.
///
/// Keys are normalized to lower case on insertion; the last write for a key
/// wins. Iteration order is deterministic (sorted by normalized key).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.0
            .get(&name.as_ref().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<String> {
        self.0.remove(&name.as_ref().to_ascii_lowercase())
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.0.contains_key(&name.as_ref().to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Payload of an external message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Transport-agnostic message produced by payload mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExternalMessage {
    pub headers: Headers,
    pub payload: Option<Payload>,
}

impl ExternalMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            headers: Headers::new(),
            payload: Some(Payload::Text(body.into())),
        }
    }

    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self {
            headers: Headers::new(),
            payload: Some(Payload::Bytes(body.into())),
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }
}

/// A fully-formed outbound HTTP request.
///
/// Header order is preserved; the signers rely on it when a named canonical
/// header list is configured.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, uri: Url) -> Self {
        Self {
            method,
            uri,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Appends a header, keeping any existing values for the same name.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Sets a header, replacing all existing values for the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// The response half of a dispatched request.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Applies the reserved header keys of `headers` to `request`, removing them
/// from the header set.
///
/// * `http.method` replaces the request method.
/// * `http.path` replaces the URI path; a missing leading `/` is inserted.
/// * `http.query` replaces the URI query string exactly as given.
pub fn apply_reserved_headers(request: &mut HttpRequest, headers: &mut Headers) -> Result<(), Error> {
    if let Some(method) = headers.remove(RESERVED_HEADER_HTTP_METHOD) {
        request.method = method
            .to_ascii_uppercase()
            .parse::<Method>()
            .map_err(|_| Error::config_invalid(format!("invalid http.method header: {method:?}")))?;
    }

    if let Some(path) = headers.remove(RESERVED_HEADER_HTTP_PATH) {
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        request.uri.set_path(&path);
    }

    if let Some(query) = headers.remove(RESERVED_HEADER_HTTP_QUERY) {
        request.uri.set_query(Some(&query));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));

        headers.insert("CONTENT-TYPE", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn reserved_headers_restructure_the_request() {
        let mut request = HttpRequest::new(
            Method::POST,
            Url::parse("https://example.org/base").unwrap(),
        );
        let mut headers = Headers::new();
        headers.insert(RESERVED_HEADER_HTTP_QUERY, "a=b&c=d");
        headers.insert(RESERVED_HEADER_HTTP_PATH, "my/awesome/path");
        headers.insert("content-type", "text/plain");

        apply_reserved_headers(&mut request, &mut headers).unwrap();

        assert_eq!(request.uri.path(), "/my/awesome/path");
        assert_eq!(request.uri.query(), Some("a=b&c=d"));
        assert!(!headers.contains(RESERVED_HEADER_HTTP_QUERY));
        assert!(!headers.contains(RESERVED_HEADER_HTTP_PATH));
        assert_eq!(headers.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn reserved_method_overrides() {
        let mut request =
            HttpRequest::new(Method::POST, Url::parse("https://example.org/").unwrap());
        let mut headers = Headers::new();
        headers.insert(RESERVED_HEADER_HTTP_METHOD, "put");

        apply_reserved_headers(&mut request, &mut headers).unwrap();
        assert_eq!(request.method, Method::PUT);
    }

    #[test]
    fn set_header_replaces_all_values() {
        let mut request =
            HttpRequest::new(Method::GET, Url::parse("https://example.org/").unwrap());
        request.append_header("X-Tag", "one");
        request.append_header("x-tag", "two");
        request.set_header("X-TAG", "three");

        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("x-tag"), Some("three"));
    }
}
