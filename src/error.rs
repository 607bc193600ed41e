use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{backend} storage error: {message}")]
    Storage { backend: String, message: String },

    #[error("{backend} storage does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl BackupError {
    pub fn storage(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BackupError::Storage {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// True when the backend refused the operation outright rather than failing it.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BackupError::Unsupported { .. })
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
