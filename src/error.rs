//! Error handling for the connectivity core.
//!
//! This module provides a centralized error type that encompasses all possible
//! error cases in the crate, from connection validation to request signing and
//! transport dispatch. It uses the `snafu` crate for error handling patterns.

use snafu::Snafu;

/// The main error enum that represents all possible errors in the crate.
/// Each variant includes context-specific information and appropriate error messages.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Connection configuration invalid: {message}"))]
    ConnectionConfigurationInvalid { message: String },

    #[snafu(display("Credentials invalid: {message}"))]
    CredentialsInvalid { message: String },

    #[snafu(display("Placeholder {placeholder} could not be resolved"))]
    PlaceholderUnresolved { placeholder: String },

    #[snafu(display("Placeholder function signature invalid: {message}"))]
    PlaceholderFunctionSignatureInvalid { message: String },

    #[snafu(display("Transport failure: {message}"))]
    TransportFailure {
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Request timed out after {millis}ms"))]
    RequestTimeout { millis: u64 },

    #[snafu(display("Connection {id} not found"))]
    ConnectionNotFound { id: String },

    #[snafu(display("Connection {id} already exists"))]
    ConnectionAlreadyExists { id: String },

    #[snafu(display("Publisher for connection {id} is gone"))]
    PublisherGone { id: String },

    #[snafu(display("Error decoding JSON"))]
    Json {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Json { source }
    }
}

/// Convenience methods for creating common error types
impl Error {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConnectionConfigurationInvalid {
            message: message.into(),
        }
    }

    pub fn credentials_invalid(message: impl Into<String>) -> Self {
        Self::CredentialsInvalid {
            message: message.into(),
        }
    }

    pub fn unresolved(placeholder: impl Into<String>) -> Self {
        Self::PlaceholderUnresolved {
            placeholder: placeholder.into(),
        }
    }

    pub fn function_signature(message: impl Into<String>) -> Self {
        Self::PlaceholderFunctionSignatureInvalid {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with(message: impl Into<String>, e: impl Into<eyre::Report>) -> Self {
        Self::TransportFailure {
            message: message.into(),
            source: Some(e.into()),
        }
    }

    /// The acknowledgement status a per-signal failure maps to.
    ///
    /// Per-signal failures never kill the pipeline; they are reported back to
    /// the sender as a failed acknowledgement carrying this status.
    pub fn ack_status(&self) -> http::StatusCode {
        match self {
            Self::PlaceholderUnresolved { .. }
            | Self::PlaceholderFunctionSignatureInvalid { .. }
            | Self::ConnectionConfigurationInvalid { .. }
            | Self::CredentialsInvalid { .. } => http::StatusCode::UNPROCESSABLE_ENTITY,

            Self::RequestTimeout { .. } => http::StatusCode::GATEWAY_TIMEOUT,

            Self::TransportFailure { .. } => http::StatusCode::BAD_GATEWAY,

            _ => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
