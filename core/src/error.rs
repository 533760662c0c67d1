/// Error types for the sync engine
use thiserror::Error;

/// Shown when an error carries nothing meant for the user.
pub const GENERIC_ERROR_TEXT: &str = "Something went wrong. Please try again.";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("View closed")]
    Closed,
}

impl SyncError {
    /// Text to surface inline or in a toast.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Server { message, .. } if !message.trim().is_empty() => message.clone(),
            SyncError::Validation(msg) => msg.clone(),
            SyncError::Identity(_) => "Please sign in again.".to_string(),
            _ => GENERIC_ERROR_TEXT.to_string(),
        }
    }

    /// Transport-level failures: the backend was never reached.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Io(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
