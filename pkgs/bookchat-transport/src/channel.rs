//! The transport channel: one persistent connection, many topics
//!
//! A channel owns at most one live link. Outbound frames go through a
//! writer task, inbound frames are decoded by a reader task and handed to
//! the single observer as [`TransportEvent`]s.
//!
//! Every connect bumps a generation counter. Subscriptions and reader
//! tasks remember the generation they were created under, so anything
//! left over from an earlier connection becomes inert after a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, TransportError};
use crate::events::TransportEvent;
use crate::frame::{ClientFrame, Dialer, FrameSink, FrameStream, ServerFrame};
use crate::models::{ConnectionState, ConversationSummaryDelta, Message};
use crate::topic::Topic;

struct Outbound {
    frame: ClientFrame,
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    connection_id: Option<Uuid>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    reader: Option<JoinHandle<()>>,
    subscriptions: HashMap<u64, Topic>,
    next_subscription: u64,
}

struct Shared {
    dialer: Arc<dyn Dialer>,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport observer is gone, event dropped");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
        self.emit(TransportEvent::Connection(state));
    }

    fn dispatch(&self, generation: u64, frame: ServerFrame) {
        match frame {
            ServerFrame::Connected => debug!("Server confirmed connection"),
            ServerFrame::Error { message } => {
                warn!("Server reported error: {}", message);
                self.emit(TransportEvent::Error(message));
            }
            ServerFrame::Message {
                subscription,
                destination,
                body,
            } => {
                let known = {
                    let inner = self.inner.lock();
                    inner.generation == generation
                        && inner.subscriptions.contains_key(&subscription)
                };
                if !known {
                    debug!(subscription, %destination, "Dropping frame for released subscription");
                    return;
                }
                match decode_event(&destination, body) {
                    Ok(event) => self.emit(event),
                    Err(reason) => warn!(%destination, "Dropping malformed event: {}", reason),
                }
            }
        }
    }

    fn connection_lost(&self, generation: u64, error: Option<String>) {
        let state = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.outbound = None;
            inner.reader = None;
            inner.subscriptions.clear();
            inner.state = if error.is_some() {
                ConnectionState::Error
            } else {
                ConnectionState::Disconnected
            };
            inner.state
        };

        match &error {
            Some(reason) => warn!("Connection failed: {}", reason),
            None => info!("Connection closed by server"),
        }
        if let Some(reason) = error {
            self.emit(TransportEvent::Error(reason));
        }
        self.emit(TransportEvent::Connection(state));
    }

    fn release(&self, id: u64, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(topic) = inner.subscriptions.remove(&id) {
            debug!(id, %topic, "Unsubscribing");
            if let Some(outbound) = &inner.outbound {
                let _ = outbound.send(Outbound {
                    frame: ClientFrame::Unsubscribe { id },
                    ack: None,
                });
            }
        }
    }
}

fn decode_event(destination: &str, body: serde_json::Value) -> std::result::Result<TransportEvent, String> {
    match Topic::parse(destination) {
        Some(Topic::Conversation(conversation_id)) => {
            let message: Message = serde_json::from_value(body).map_err(|e| e.to_string())?;
            if message.conversation_id != conversation_id {
                return Err(format!(
                    "message belongs to {} not {}",
                    message.conversation_id, conversation_id
                ));
            }
            Ok(TransportEvent::Message {
                conversation_id,
                message,
            })
        }
        Some(Topic::Summary(participant_id)) => {
            let delta: ConversationSummaryDelta =
                serde_json::from_value(body).map_err(|e| e.to_string())?;
            Ok(TransportEvent::Summary {
                participant_id,
                delta,
            })
        }
        None => Err("unknown destination".to_string()),
    }
}

async fn run_writer(mut sink: FrameSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { frame, ack }) = outbound.recv().await {
        let closing = matches!(frame, ClientFrame::Disconnect);
        let result = sink.send(frame).await;
        let failed = result.is_err();
        match (ack, result) {
            (Some(ack), result) => {
                let _ = ack.send(result);
            }
            (None, Err(e)) => warn!("Failed to write frame: {}", e),
            (None, Ok(())) => {}
        }
        if failed || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn run_reader(shared: Weak<Shared>, generation: u64, mut stream: FrameStream) {
    let error = loop {
        let item = stream.next().await;
        let Some(strong) = shared.upgrade() else {
            return;
        };
        match item {
            Some(Ok(frame)) => strong.dispatch(generation, frame),
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };
    if let Some(shared) = shared.upgrade() {
        shared.connection_lost(generation, error);
    }
}

/// Handle to the push channel. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct TransportChannel {
    shared: Arc<Shared>,
}

impl TransportChannel {
    /// Create a disconnected channel and the receiver its events go to
    pub fn new(dialer: Arc<dyn Dialer>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            dialer,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                connection_id: None,
                outbound: None,
                reader: None,
                subscriptions: HashMap::new(),
                next_subscription: 1,
            }),
            events,
        });
        (Self { shared }, receiver)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Id of the live connection, used to correlate log lines
    pub fn connection_id(&self) -> Option<Uuid> {
        self.shared.inner.lock().connection_id
    }

    /// Topics with a live subscription on the current connection
    pub fn active_topics(&self) -> Vec<Topic> {
        self.shared
            .inner
            .lock()
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    /// Establish the connection.
    ///
    /// Calling this while connected or connecting only re-announces the
    /// current state. A failed dial leaves the channel in `Error`; the
    /// caller decides whether and when to try again.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let generation = {
            let mut inner = self.shared.inner.lock();
            let current = inner.state;
            match current {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    drop(inner);
                    self.shared.emit(TransportEvent::Connection(current));
                    return Ok(());
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.generation
        };
        self.shared
            .emit(TransportEvent::Connection(ConnectionState::Connecting));

        let connection_id = Uuid::new_v4();
        let link = match self.shared.dialer.dial().await {
            Ok(link) => link,
            Err(e) => {
                let superseded = self.shared.inner.lock().generation != generation;
                if !superseded {
                    warn!(%connection_id, "Dial failed: {}", e);
                    self.shared.emit(TransportEvent::Error(e.to_string()));
                    self.shared.set_state(ConnectionState::Error);
                }
                return Err(e);
            }
        };

        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                debug!(%connection_id, "Connect superseded by disconnect, dropping link");
                return Err(TransportError::Closed);
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(link.sink, outbound_rx));
            let reader = tokio::spawn(run_reader(
                Arc::downgrade(&self.shared),
                generation,
                link.stream,
            ));

            inner.outbound = Some(outbound_tx);
            inner.reader = Some(reader);
            inner.connection_id = Some(connection_id);
            inner.subscriptions.clear();
            inner.state = ConnectionState::Connected;
        }

        info!(%connection_id, "Push channel connected");
        self.shared
            .emit(TransportEvent::Connection(ConnectionState::Connected));
        Ok(())
    }

    /// Tear down the connection. Every outstanding subscription becomes
    /// inert. Safe to call in any state.
    #[instrument(skip(self))]
    pub fn disconnect(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            if let Some(outbound) = inner.outbound.take() {
                let _ = outbound.send(Outbound {
                    frame: ClientFrame::Disconnect,
                    ack: None,
                });
            }
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            inner.subscriptions.clear();
            if let Some(id) = inner.connection_id.take() {
                info!(connection_id = %id, "Push channel disconnected");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Subscribe to `topic` on the live connection.
    ///
    /// Resolves once the subscribe frame has been written. Subscribing to
    /// a topic that already has a live subscription is not guarded here.
    #[instrument(skip(self))]
    pub async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let (id, generation, ack) = {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_connected() {
                return Err(TransportError::NotConnected);
            }
            let outbound = inner
                .outbound
                .clone()
                .ok_or(TransportError::NotConnected)?;

            let id = inner.next_subscription;
            inner.next_subscription += 1;

            let (ack_tx, ack_rx) = oneshot::channel();
            outbound
                .send(Outbound {
                    frame: ClientFrame::Subscribe {
                        id,
                        destination: topic.destination(),
                    },
                    ack: Some(ack_tx),
                })
                .map_err(|_| TransportError::NotConnected)?;
            inner.subscriptions.insert(id, topic.clone());
            (id, inner.generation, ack_rx)
        };

        let outcome = match ack.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        };

        match outcome {
            Ok(()) => {
                debug!(id, "Subscribed");
                Ok(Subscription {
                    id,
                    topic,
                    generation,
                    shared: Arc::downgrade(&self.shared),
                    released: false,
                })
            }
            Err(e) => {
                let mut inner = self.shared.inner.lock();
                if inner.generation == generation {
                    inner.subscriptions.remove(&id);
                }
                Err(TransportError::SubscribeFailed {
                    topic,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// A live topic subscription.
///
/// Released by [`Subscription::unsubscribe`] or on drop, whichever comes
/// first. Releasing after the connection it belongs to is gone is a no-op.
pub struct Subscription {
    id: u64,
    topic: Topic,
    generation: u64,
    shared: Weak<Shared>,
    released: bool,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.release(self.id, self.generation);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("generation", &self.generation)
            .finish()
    }
}
