//! Error taxonomy for the driver layer.
//!
//! Every variant is `Clone` so a single failure can be handed to all
//! waiters of a coalesced call (see [`crate::single_flight`]).

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by the document-service driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// Missing or empty endpoint, id, summary subtree or policy value.
    /// Always raised before any network call is issued.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed locator path, URL or summary blob.
    #[error("parse error: {0}")]
    Parse(String),

    /// The backend refused to create the document.
    #[error("document creation rejected ({status}): {message}")]
    Creation {
        /// HTTP status returned by the orderer.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// REST or socket failure, including timeouts.
    #[error("transport error: {0}")]
    Transport(String),

    /// A REST call completed with a non-success status.
    #[error("backend error ({status}): {message}")]
    Api {
        /// HTTP status returned by the backend.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The delta stream handshake was rejected or a frame made no sense.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend lacks the requested capability.
    #[error("operation not supported: {0}")]
    UnsupportedOperation(&'static str),

    /// Local (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),
}

impl DriverError {
    /// Configuration error naming every missing locator field.
    pub fn missing_endpoints(fields: &[&str]) -> Self {
        Self::Configuration(format!(
            "missing required endpoint(s): {}",
            fields.join(", ")
        ))
    }

    /// Whether the runtime may reasonably retry the failed operation.
    ///
    /// The driver never retries on its own; this only classifies.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Errors caused by the caller's input rather than the network.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Parse(_) | Self::UnsupportedOperation(_)
        )
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Api {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_timeout() {
            return Self::Transport(format!("request timed out: {err}"));
        }
        if err.is_decode() {
            return Self::Parse(err.to_string());
        }
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<url::ParseError> for DriverError {
    fn from(err: url::ParseError) -> Self {
        Self::Parse(format!("invalid url: {err}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DriverError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(format!("socket: {err}"))
    }
}
