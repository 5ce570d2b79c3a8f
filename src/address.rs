//! HTTP push target addresses.
//!
//! A target address has the form `METHOD:path?query#fragment`, where the path,
//! query and fragment may contain placeholders. `GET`, `POST`, `PUT` and
//! `PATCH` are accepted; `DELETE` is rejected for push targets.

use http::Method;

use crate::error::Error;
use crate::placeholder::{PlaceholderContext, Template};

const ALLOWED_METHODS: &[Method] = &[Method::GET, Method::POST, Method::PUT, Method::PATCH];

/// A parsed HTTP push address: verb plus a renderable path template.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpPushAddress {
    pub method: Method,
    template: Template,
    raw: String,
}

/// The rendered URI components of an address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedAddress {
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl HttpPushAddress {
    pub fn parse(address: &str) -> Result<Self, Error> {
        if address.is_empty() {
            return Err(Error::config_invalid("target address must not be empty"));
        }

        let Some((method, rest)) = address.split_once(':') else {
            return Err(Error::config_invalid(format!(
                "target address without method: {address:?}"
            )));
        };

        if method == "DELETE" {
            return Err(Error::config_invalid(format!(
                "method DELETE is not supported for HTTP push targets: {address:?}"
            )));
        }

        let method = ALLOWED_METHODS
            .iter()
            .find(|allowed| allowed.as_str() == method)
            .cloned()
            .ok_or_else(|| {
                Error::config_invalid(format!(
                    "method {method:?} is not one of GET, POST, PUT, PATCH: {address:?}"
                ))
            })?;

        if rest.is_empty() {
            return Err(Error::config_invalid(format!(
                "target address without path: {address:?}"
            )));
        }

        Ok(Self {
            method,
            template: Template::parse(rest)?,
            raw: address.to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Renders the path template and splits it into URI components.
    pub fn render(&self, ctx: &PlaceholderContext) -> Result<RenderedAddress, Error> {
        let rendered = self.template.render(ctx)?;

        let (rest, fragment) = match rendered.split_once('#') {
            Some((rest, fragment)) => (rest.to_owned(), Some(fragment.to_owned())),
            None => (rendered, None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (rest, None),
        };

        Ok(RenderedAddress {
            path,
            query,
            fragment,
        })
    }
}
