//! Error types for the Graph transport.

use thiserror::Error;

/// Result type alias using `GraphError`.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur when talking to the governance API.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Client configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The service answered with a non-success status.
    #[error("Graph API error ({status}): {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        inner_error: Option<String>,
        /// Raw response body, kept verbatim for diagnostics.
        body: String,
    },

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// The caller cancelled the operation.
    #[error("Request cancelled")]
    Cancelled,

    /// Throttling persisted beyond the retry budget.
    #[error("Maximum retries ({attempts}) exceeded while throttled")]
    MaxRetriesExceeded { attempts: u32 },
}

impl GraphError {
    /// HTTP status returned by the service, when the error came from a response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            GraphError::Api { status, .. } => Some(*status),
            GraphError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Raw error body returned by the service.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self {
            GraphError::Api { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }

    /// OData error code (`Request_ResourceNotFound`, `Authorization_RequestDenied`, ...).
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            GraphError::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Whether the service reported that the addressed object does not exist.
    ///
    /// Graph uses 404 for most missing objects but a handful of endpoints answer
    /// 400 with a `*NotFound` code instead.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            GraphError::Api { status, code, .. } => {
                *status == 404 || code.ends_with("NotFound") || code.ends_with("_NotFound")
            }
            _ => false,
        }
    }
}
