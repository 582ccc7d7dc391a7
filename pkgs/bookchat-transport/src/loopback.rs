//! In-process push server
//!
//! Speaks the same frames as the WebSocket server. Client frames are
//! applied synchronously while the channel's writer sends them, so once
//! `subscribe` returns the server already routes that topic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::frame::{ClientFrame, Dialer, Link, ServerFrame};
use crate::models::{ConversationSummaryDelta, Message};
use crate::topic::Topic;

struct ClientSlot {
    tx: mpsc::UnboundedSender<Result<ServerFrame>>,
    subscriptions: HashMap<u64, String>,
}

#[derive(Default)]
struct ServerState {
    clients: HashMap<u64, ClientSlot>,
    next_client: u64,
    failing_dials: usize,
    dial_count: usize,
}

/// Shared handle to an in-memory push server
#[derive(Clone, Default)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` dials fail
    pub fn fail_next_dials(&self, count: usize) {
        self.state.lock().failing_dials = count;
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().dial_count
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Every destination currently subscribed, across all clients
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut all: Vec<String> = state
            .clients
            .values()
            .flat_map(|c| c.subscriptions.values().cloned())
            .collect();
        all.sort();
        all
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        let destination = topic.destination();
        self.state
            .lock()
            .clients
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| **d == destination)
            .count()
    }

    /// Deliver a raw body to every subscriber of `destination`.
    /// Returns the number of deliveries.
    pub fn publish_raw(&self, destination: &str, body: serde_json::Value) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for slot in state.clients.values() {
            for (id, subscribed) in &slot.subscriptions {
                if subscribed != destination {
                    continue;
                }
                let frame = ServerFrame::Message {
                    subscription: *id,
                    destination: destination.to_string(),
                    body: body.clone(),
                };
                if slot.tx.unbounded_send(Ok(frame)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn publish<T: Serialize>(&self, topic: &Topic, payload: &T) -> usize {
        match serde_json::to_value(payload) {
            Ok(body) => self.publish_raw(&topic.destination(), body),
            Err(e) => {
                debug!("Loopback publish skipped: {}", e);
                0
            }
        }
    }

    pub fn publish_message(&self, message: &Message) -> usize {
        self.publish(&Topic::Conversation(message.conversation_id.clone()), message)
    }

    pub fn publish_summary(&self, participant: &str, delta: &ConversationSummaryDelta) -> usize {
        self.publish(&Topic::Summary(participant.to_string()), delta)
    }

    /// Send an ERROR frame to every client
    pub fn broadcast_error(&self, message: &str) {
        let state = self.state.lock();
        for slot in state.clients.values() {
            let _ = slot.tx.unbounded_send(Ok(ServerFrame::Error {
                message: message.to_string(),
            }));
        }
    }

    /// Close every connection as if the server went away
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        debug!("Loopback dropping {} connection(s)", state.clients.len());
        state.clients.clear();
    }

    /// Fail every connection with a transport error
    pub fn break_connections(&self, reason: &str) {
        let mut state = self.state.lock();
        for (_, slot) in state.clients.drain() {
            let _ = slot
                .tx
                .unbounded_send(Err(TransportError::ConnectFailed(reason.to_string())));
        }
    }

    fn apply(&self, client: u64, frame: ClientFrame) -> Result<()> {
        let mut state = self.state.lock();
        match frame {
            ClientFrame::Subscribe { id, destination } => {
                let slot = state.clients.get_mut(&client).ok_or(TransportError::Closed)?;
                slot.subscriptions.insert(id, destination);
            }
            ClientFrame::Unsubscribe { id } => {
                let slot = state.clients.get_mut(&client).ok_or(TransportError::Closed)?;
                slot.subscriptions.remove(&id);
            }
            ClientFrame::Disconnect => {
                state.clients.remove(&client);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for LoopbackServer {
    async fn dial(&self) -> Result<Link> {
        let client = {
            let mut state = self.state.lock();
            state.dial_count += 1;
            if state.failing_dials > 0 {
                state.failing_dials -= 1;
                return Err(TransportError::ConnectFailed(
                    "loopback refused the connection".to_string(),
                ));
            }
            state.next_client += 1;
            state.next_client
        };

        let (tx, rx) = mpsc::unbounded();
        self.state.lock().clients.insert(
            client,
            ClientSlot {
                tx,
                subscriptions: HashMap::new(),
            },
        );

        let sink = futures::sink::unfold(self.clone(), move |server, frame: ClientFrame| async move {
            server.apply(client, frame)?;
            Ok::<_, TransportError>(server)
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(rx),
        })
    }
}
