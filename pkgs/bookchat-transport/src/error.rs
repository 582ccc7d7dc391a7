//! Error types for the push channel

use thiserror::Error;

use crate::topic::Topic;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Connection closed")]
    Closed,
    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed { topic: Topic, reason: String },
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
