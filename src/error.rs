//! Error taxonomy for the offline transaction engine.
//!
//! `SyncError` is what the queue, reconciler and configuration layers return
//! to callers. `SubmitError` is the classified outcome of a failed remote
//! submission; the orchestrator records it on the transaction row instead of
//! propagating it.

use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The local store could not commit. Fatal to the calling sale flow.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// Receipt already applied server-side. Treated as success by the
    /// orchestrator, surfaced only by lower-level calls.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("transaction not found: {0}")]
    NotFound(String),

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Persistence(format!("json: {err}"))
    }
}

impl From<SubmitError> for SyncError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Network(m) => SyncError::Network(m),
            SubmitError::Timeout(m) => SyncError::Timeout(m),
            SubmitError::Server { status, message } => {
                SyncError::Network(format!("{message} (HTTP {status})"))
            }
            SubmitError::Rejected { message, .. } => SyncError::Validation(message),
            SubmitError::Unauthorized(m) => SyncError::Config(m),
            SubmitError::Unknown(m) => SyncError::Unknown(m),
        }
    }
}

/// Classified failure of a single remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// Connection could not be established or dropped mid-request.
    #[error("{0}")]
    Network(String),

    #[error("{0}")]
    Timeout(String),

    /// 408, 429 and 5xx responses.
    #[error("{message} (HTTP {status})")]
    Server { status: u16, message: String },

    /// 4xx the server will keep rejecting (validation, insufficient funds).
    #[error("{message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// 401/403: the terminal credentials are wrong, not the transaction.
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Unknown(String),
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SubmitError::Rejected { .. })
    }

    /// Failures that will hit every remaining item the same way: lost
    /// connectivity or rejected terminal credentials.
    pub fn halts_pass(&self) -> bool {
        matches!(self, SubmitError::Network(_) | SubmitError::Unauthorized(_))
    }

    /// Failures after which the server may still have applied the request.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            SubmitError::Network(_) | SubmitError::Timeout(_) | SubmitError::Unknown(_) => true,
            SubmitError::Server { status, .. } => *status >= 500,
            SubmitError::Rejected { .. } | SubmitError::Unauthorized(_) => false,
        }
    }
}
