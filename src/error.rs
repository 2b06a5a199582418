//! Error types for the local store and the remote order API.

use thiserror::Error;

/// Failures of the on-device store.
///
/// Callers must treat every variant as transient: nothing here retries on
/// its own, the mutation queue above it already does.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No durable storage facility could be opened (missing data dir,
    /// unopenable database file).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Disk, quota or SQL failure while the store was open.
    #[error("storage I/O error: {0}")]
    Io(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Short machine-readable code, used in logs and dead-letter reasons.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "storage_unavailable",
            Self::Io(_) => "storage_io_error",
            Self::Serialization(_) => "serialization_error",
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Failures talking to the admin dashboard order API.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Timeout(String),

    /// Non-success HTTP status, with the friendliest message we could build.
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("invalid response from admin dashboard: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RemoteError {
    /// HTTP status when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
