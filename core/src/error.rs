/// Error types for the roster sync engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Sync engine is no longer running")]
    EngineClosed,
}

impl SyncError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Io(_) | SyncError::Transport(_) => true,
            SyncError::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
