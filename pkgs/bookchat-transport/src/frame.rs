//! Frames exchanged with the push server and the link abstraction

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Client to server frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe { id: u64, destination: String },
    Unsubscribe { id: u64 },
    Disconnect,
}

/// Server to client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Connected,
    Message {
        subscription: u64,
        destination: String,
        body: serde_json::Value,
    },
    Error {
        message: String,
    },
}

pub type FrameSink = Pin<Box<dyn Sink<ClientFrame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ServerFrame>> + Send>>;

/// An established full-duplex connection
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Establishes links to the push server.
///
/// Implementations must not retry internally; the caller decides when to
/// dial again.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Link>;
}
