//! Reconciliation error types.

use egov_graph::GraphError;
use thiserror::Error;

/// Result type alias using `ReconcileError`.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that abort a single resource operation.
///
/// None of these are ever folded into a "skipped" outcome: the orchestrator
/// receives them and halts dependent resources.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Desired state is invalid; raised before any network call.
    #[error("Invalid properties: {0}")]
    Validation(String),

    /// A referenced parent object could not be resolved by its natural key.
    #[error("{kind} '{key}' not found")]
    ParentNotFound { kind: &'static str, key: String },

    /// More than one remote object matches a natural key.
    #[error("{count} {kind} objects match '{key}'; refusing to pick one")]
    Ambiguous {
        kind: &'static str,
        key: String,
        count: usize,
    },

    /// Transport or remote-service failure.
    #[error(transparent)]
    Remote(#[from] GraphError),

    /// The write succeeded but the object could not be read back.
    #[error("{kind} {id} was written but could not be read back: {source}")]
    PartialSuccess {
        kind: &'static str,
        id: String,
        #[source]
        source: Box<ReconcileError>,
    },

    /// A bounded poll ran out of attempts or time.
    #[error("Exhausted retries for {operation} after {attempts} attempts (last state: {last_state})")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_state: String,
    },

    /// The service reported a terminal failure state for an asynchronous request.
    #[error("{operation} ended in state {state}{}", diagnostic_suffix(.diagnostic))]
    DeliveryFailed {
        operation: String,
        state: String,
        diagnostic: Option<String>,
    },

    /// No handler is registered for the requested resource type.
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    /// Envelope (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

fn diagnostic_suffix(diagnostic: &Option<String>) -> String {
    diagnostic
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl ReconcileError {
    /// Whether this error means the looked-up object simply does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::Remote(e) if e.is_not_found())
    }

    /// Whether the run was cancelled, locally or while a request was in flight.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ReconcileError::Cancelled | ReconcileError::Remote(GraphError::Cancelled)
        )
    }

    /// HTTP status reported by the remote service, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            ReconcileError::Remote(e) => e.status(),
            ReconcileError::PartialSuccess { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Raw error body reported by the remote service, if any.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self {
            ReconcileError::Remote(e) => e.body(),
            ReconcileError::PartialSuccess { source, .. } => source.body(),
            _ => None,
        }
    }

    /// Stable machine-readable error code for the response envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::Validation(_) => "InvalidProperties",
            ReconcileError::ParentNotFound { .. } => "ParentNotFound",
            ReconcileError::Ambiguous { .. } => "AmbiguousMatch",
            ReconcileError::Remote(GraphError::Cancelled) | ReconcileError::Cancelled => {
                "Cancelled"
            }
            ReconcileError::Remote(_) => "RemoteError",
            ReconcileError::PartialSuccess { .. } => "PartialSuccess",
            ReconcileError::RetriesExhausted { .. } => "RetriesExhausted",
            ReconcileError::DeliveryFailed { .. } => "DeliveryFailed",
            ReconcileError::UnknownResourceType(_) => "UnknownResourceType",
            ReconcileError::Serialization(_) => "InvalidEnvelope",
        }
    }
}
