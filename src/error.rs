//! Crate-wide error taxonomy.
//!
//! Every error value carries exactly one [`VmError`] variant. Callers match on
//! the variant, never on message text.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("image not ready: {0}")]
    ImageNotReady(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("capability not supported: {0}")]
    Capability(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    /// Short machine-readable kind name, useful for metrics labels and test
    /// assertions that want to check "it failed the right way" without
    /// string-matching the message.
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::Validation(_) => "validation",
            VmError::NotFound(_) => "not_found",
            VmError::AlreadyExists(_) => "already_exists",
            VmError::InvalidState(_) => "invalid_state",
            VmError::ImageNotReady(_) => "image_not_ready",
            VmError::ResourceLimitExceeded(_) => "resource_limit_exceeded",
            VmError::Capability(_) => "capability",
            VmError::Transport(_) => "transport",
            VmError::Timeout { .. } => "timeout",
            VmError::Cancelled => "cancelled",
            VmError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for VmError {
    fn from(e: serde_json::Error) -> Self {
        VmError::Internal(format!("serialization error: {e}"))
    }
}
