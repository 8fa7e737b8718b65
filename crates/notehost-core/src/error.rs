//! Error types for notehost

use thiserror::Error;

/// Result type alias using notehost's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the host-domain collaborators
#[derive(Error, Debug)]
pub enum Error {
    // Entity errors (E001-E099)
    #[error("Note '{0}' not found.")]
    NoteNotFound(String),

    #[error("User '{0}' not found.")]
    UserNotFound(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Storage errors (E400-E499)
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoteNotFound(_) => "E001",
            Self::UserNotFound(_) => "E002",
            Self::StorageError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::InvalidInput(_) => "E800",
            Self::Io(_) => "E9999",
        }
    }

    /// True when the error means the addressed entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoteNotFound(_) | Self::UserNotFound(_))
    }
}
