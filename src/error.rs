//! Failure taxonomy for the operation and query paths.
//!
//! Lookup and licensing failures are reported before any handler runs;
//! handler failures in the sync path become a failed result, in the async
//! path a failed job. Nothing here is retried automatically.

use crate::types::SubscriptionTier;
use thiserror::Error;

/// Everything that can go wrong executing an operation or querying a model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    #[error("operation '{operation_id}' not found for language '{language_id}'")]
    OperationNotFound {
        language_id: String,
        operation_id: String,
    },

    #[error("operation requires an authenticated user")]
    AuthenticationRequired,

    #[error("operation requires the '{required}' tier, user has '{actual}'")]
    InsufficientTier {
        required: SubscriptionTier,
        actual: SubscriptionTier,
    },

    #[error("failed to resolve document: {0}")]
    DocumentResolutionFailed(String),

    #[error("operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("operation handler failed: {0}")]
    HandlerFailed(String),

    #[error("invalid uri '{0}'")]
    InvalidUri(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ExecuteError {
    /// Stable machine-readable code for protocol bindings.
    pub fn code(&self) -> &'static str {
        match self {
            ExecuteError::OperationNotFound { .. } => "OperationNotFound",
            ExecuteError::AuthenticationRequired => "AuthenticationRequired",
            ExecuteError::InsufficientTier { .. } => "InsufficientTier",
            ExecuteError::DocumentResolutionFailed(_) => "DocumentResolutionFailed",
            ExecuteError::Timeout { .. } => "Timeout",
            ExecuteError::HandlerFailed(_) => "HandlerFailed",
            ExecuteError::InvalidUri(_) => "InvalidUri",
            ExecuteError::NodeNotFound(_) => "NodeNotFound",
            ExecuteError::InvalidQuery(_) => "InvalidQuery",
            ExecuteError::InternalError(_) => "InternalError",
        }
    }
}
