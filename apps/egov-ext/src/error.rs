//! Extension error types and exit codes

use egov_reconcile::{ConfigError, ReconcileError};
use serde_json::{json, Value};
use thiserror::Error;

/// Exit codes for the extension
/// - 0: Success
/// - 1: General error
/// - 2: Authentication or authorization rejected
/// - 3: Network error
/// - 4: Invalid input or unresolvable reference
/// - 5: Server error or asynchronous delivery failure
pub type ExtResult<T> = Result<T, ExtError>;

#[derive(Debug, Error)]
pub enum ExtError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot read request envelope: {0}")]
    Input(#[from] std::io::Error),

    #[error("Request envelope is not JSON: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl ExtError {
    /// Machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ExtError::Config(_) => "InvalidConfiguration",
            ExtError::Input(_) => "InputError",
            ExtError::Envelope(_) => "InvalidEnvelope",
            ExtError::Reconcile(e) => e.code(),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> u8 {
        let ExtError::Reconcile(error) = self else {
            return match self {
                ExtError::Envelope(_) => 4,
                _ => 1,
            };
        };
        match error {
            ReconcileError::Validation(_)
            | ReconcileError::ParentNotFound { .. }
            | ReconcileError::Ambiguous { .. }
            | ReconcileError::UnknownResourceType(_)
            | ReconcileError::Serialization(_) => 4,
            ReconcileError::DeliveryFailed { .. } | ReconcileError::RetriesExhausted { .. } => 5,
            cancelled if cancelled.is_cancelled() => 1,
            other => match other.status() {
                Some(401 | 403) => 2,
                Some(status) if status >= 500 => 5,
                Some(_) => 4,
                None => 3,
            },
        }
    }

    /// The error envelope written to stdout.
    pub fn envelope(&self) -> Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let ExtError::Reconcile(e) = self {
            if let Some(status) = e.status() {
                error["status"] = json!(status);
            }
            if let Some(body) = e.body() {
                error["body"] = json!(body);
            }
        }
        json!({ "error": error })
    }
}
