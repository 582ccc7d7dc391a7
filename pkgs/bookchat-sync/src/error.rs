//! Error types for conversation sync

use bookchat_transport::{ConversationId, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Server returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("No conversation is open")]
    NoOpenSession,
    #[error("Conversation {0} no longer accepts messages")]
    ChatDisabled(ConversationId),
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Sync engine has stopped")]
    EngineStopped,
}

impl SyncError {
    /// Whether retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Request(_) => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
