//! WebSocket dialer built on tokio-tungstenite

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::frame::{ClientFrame, Dialer, Link, ServerFrame};

/// Dials the push server over a WebSocket, one JSON frame per text message
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn encode(frame: ClientFrame) -> Result<WsMessage> {
    let json = serde_json::to_string(&frame)?;
    Ok(WsMessage::Text(json.into()))
}

fn decode(message: WsMessage) -> Option<ServerFrame> {
    match message {
        WsMessage::Text(text) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                None
            }
        },
        WsMessage::Close(frame) => {
            debug!("Server closed the socket: {:?}", frame);
            None
        }
        _ => None,
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Link> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        info!("WebSocket connected to {}", self.url);

        let (ws_sink, ws_stream) = socket.split();

        let sink = ws_sink
            .sink_map_err(TransportError::from)
            .with(|frame: ClientFrame| future::ready(encode(frame)));

        let stream = ws_stream.filter_map(|item| {
            future::ready(match item {
                Ok(message) => decode(message).map(Ok),
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
