//! Sync engine - wires the transport, directory, ledger, session and
//! aggregate counter together on a single task.
//!
//! Everything that mutates sync state runs inside [`SyncEngine::run`]: user
//! commands, transport events, refresh ticks and reconnect attempts are
//! multiplexed with `tokio::select!`, so no two handlers ever interleave.
//! Pulls are awaited inline and events queued meanwhile are applied after
//! the pull result.
//!
//! Callers talk to the engine through a cloneable [`SyncHandle`] and read
//! its state from `watch` snapshots.

use std::sync::Arc;

use bookchat_transport::{
    ConnectionState, Conversation, ConversationId, ConversationSummaryDelta, Message,
    ParticipantId, Subscription, Topic, TransportChannel, TransportEvent,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::aggregate::{AggregateUnreadCounter, Recount, UnreadBadge};
use crate::api::{open_or_create_conversation, ChatApi, NewConversation};
use crate::config::SyncConfig;
use crate::directory::{ConversationDirectory, ConversationView, DirectoryStatus};
use crate::error::{Result, SyncError};
use crate::ledger::UnreadLedger;
use crate::session::{ActiveSession, AppendOutcome, SessionView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Customer,
    Employee,
    Admin,
}

/// The local participant, as supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub role: Role,
}

impl Identity {
    pub fn new(participant_id: impl Into<ParticipantId>, role: Role) -> Self {
        Self {
            participant_id: participant_id.into(),
            role,
        }
    }
}

/// Everything a chat screen renders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSnapshot {
    pub connection: ConnectionState,
    /// Non-blocking notice, e.g. while live updates are down
    pub banner: Option<String>,
    pub directory: DirectoryStatus,
    /// Chattable conversations, newest first, with ledger counts
    pub conversations: Vec<ConversationView>,
    pub session: Option<SessionView>,
    /// Ledger total across tracked conversations
    pub unread_total: u32,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            banner: None,
            directory: DirectoryStatus::Empty,
            conversations: Vec::new(),
            session: None,
            unread_total: 0,
        }
    }
}

enum Command {
    Refresh {
        reply: oneshot::Sender<Result<()>>,
    },
    Open {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenBooking {
        request: NewConversation,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    RetryOpen {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SendImage {
        file_name: String,
        data: Bytes,
        caption: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    LoadOlder {
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end of a running [`SyncEngine`]
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ChatSnapshot>,
    badge: watch::Receiver<UnreadBadge>,
}

impl SyncHandle {
    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot.clone()
    }

    pub fn badge(&self) -> UnreadBadge {
        self.badge.borrow().clone()
    }

    pub fn watch_badge(&self) -> watch::Receiver<UnreadBadge> {
        self.badge.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Re-pull the conversation list and unread counts
    pub async fn refresh(&self) -> Result<()> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    pub async fn open(&self, conversation_id: impl Into<ConversationId>) -> Result<()> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::Open {
            conversation_id,
            reply,
        })
        .await?
    }

    /// Create the booking's conversation (or find the existing one) and
    /// open it
    pub async fn open_booking(&self, request: NewConversation) -> Result<Conversation> {
        self.request(|reply| Command::OpenBooking { request, reply })
            .await?
    }

    /// Retry a session whose initial pull failed
    pub async fn retry_open(&self) -> Result<()> {
        self.request(|reply| Command::RetryOpen { reply }).await?
    }

    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply })
            .await?
    }

    pub async fn send_image(
        &self,
        file_name: impl Into<String>,
        data: Bytes,
        caption: Option<String>,
    ) -> Result<()> {
        let file_name = file_name.into();
        self.request(|reply| Command::SendImage {
            file_name,
            data,
            caption,
            reply,
        })
        .await?
    }

    pub async fn load_older(&self) -> Result<usize> {
        self.request(|reply| Command::LoadOlder { reply }).await?
    }

    /// Tear down subscriptions, timers and the connection, then stop the
    /// engine task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    identity: Identity,
    api: Arc<dyn ChatApi>,
    transport: TransportChannel,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    directory: ConversationDirectory,
    ledger: UnreadLedger,
    session: ActiveSession,
    aggregate: AggregateUnreadCounter,
    summary: Option<Subscription>,
    connection: ConnectionState,
    banner: Option<String>,
    reconnect_at: Option<Instant>,
    recount_pending: bool,
    snapshot_tx: watch::Sender<ChatSnapshot>,
    badge_tx: watch::Sender<UnreadBadge>,
}

impl SyncEngine {
    /// Start the engine on a new task. `events` must be the receiver that
    /// came with `transport`.
    pub fn spawn(
        config: SyncConfig,
        identity: Identity,
        api: Arc<dyn ChatApi>,
        transport: TransportChannel,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> SyncHandle {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(ChatSnapshot::default());
        let (badge_tx, badge) = watch::channel(UnreadBadge::default());

        let participant = identity.participant_id.clone();
        let engine = SyncEngine {
            directory: ConversationDirectory::new(
                participant.clone(),
                config.conversation_page_size,
                config.max_conversation_pages,
            ),
            ledger: UnreadLedger::new(),
            session: ActiveSession::new(participant.clone(), config.message_page_size),
            aggregate: AggregateUnreadCounter::new(
                participant,
                config.conversation_page_size,
                config.max_conversation_pages,
                config.unread_refresh_interval,
            ),
            config,
            identity,
            api,
            transport,
            events,
            commands,
            summary: None,
            connection: ConnectionState::Disconnected,
            banner: None,
            reconnect_at: None,
            recount_pending: false,
            snapshot_tx,
            badge_tx,
        };
        tokio::spawn(engine.run());

        SyncHandle {
            commands: command_tx,
            snapshot,
            badge,
        }
    }

    #[instrument(skip_all, fields(participant = %self.identity.participant_id))]
    async fn run(mut self) {
        self.start().await;
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown();
                        self.respond(reply, ());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All handles dropped");
                        self.teardown();
                        break;
                    }
                },
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                    while let Ok(event) = self.events.try_recv() {
                        self.handle_event(event).await;
                    }
                    if self.recount_pending {
                        self.recount().await;
                    }
                }
                _ = self.aggregate.tick() => self.resync_unread().await,
                _ = sleep_until(self.reconnect_at), if self.reconnect_at.is_some() => {
                    self.reconnect().await;
                }
            }
            self.publish();
        }
        info!("Sync engine stopped");
    }

    async fn start(&mut self) {
        info!(role = ?self.identity.role, "Starting sync engine");
        self.connect().await;
        if let Err(e) = self.reload().await {
            warn!("Initial pull failed: {}", e);
        }
        self.aggregate.activate();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh { reply } => {
                let result = self.reload().await;
                self.respond(reply, result);
            }
            Command::Open {
                conversation_id,
                reply,
            } => {
                let result = match self.directory.get(&conversation_id).cloned() {
                    Some(conversation) => self.open(conversation).await,
                    None => Err(SyncError::NotFound(format!(
                        "conversation {}",
                        conversation_id
                    ))),
                };
                self.respond(reply, result);
            }
            Command::OpenBooking { request, reply } => {
                let result = self.open_booking(request).await;
                self.respond(reply, result);
            }
            Command::RetryOpen { reply } => {
                let result = self
                    .session
                    .retry(self.api.as_ref(), &self.transport)
                    .await;
                if result.is_ok() {
                    self.pin_open_conversation();
                }
                self.respond(reply, result);
            }
            Command::Close { reply } => {
                self.session.close();
                self.respond(reply, ());
            }
            Command::SendText { text, reply } => {
                let result = self.session.send_text(&text, self.api.as_ref()).await;
                if let Err(e) = &result {
                    warn!("Send failed: {}", e);
                }
                self.respond(reply, result);
            }
            Command::SendImage {
                file_name,
                data,
                caption,
                reply,
            } => {
                let result = self
                    .session
                    .send_image(file_name, data, caption, self.api.as_ref())
                    .await;
                if let Err(e) = &result {
                    warn!("Image send failed: {}", e);
                }
                self.respond(reply, result);
            }
            Command::LoadOlder { reply } => {
                let result = self.session.load_older(self.api.as_ref()).await;
                self.respond(reply, result);
            }
            // Handled by the run loop
            Command::Shutdown { reply } => self.respond(reply, ()),
        }
    }

    /// Publish first so the caller observes the command's effect
    fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    /// Closed conversations open read-only
    async fn open(&mut self, conversation: Conversation) -> Result<()> {
        self.session
            .open(conversation, self.api.as_ref(), &self.transport)
            .await?;
        self.pin_open_conversation();
        Ok(())
    }

    async fn open_booking(&mut self, request: NewConversation) -> Result<Conversation> {
        let conversation = open_or_create_conversation(self.api.as_ref(), request).await?;
        if self.directory.get(&conversation.conversation_id).is_none() {
            // Membership only comes from a pull
            if let Err(e) = self.reload().await {
                warn!("Pull after creating {} failed: {}", conversation.conversation_id, e);
            }
        }
        self.open(conversation.clone()).await?;
        Ok(conversation)
    }

    fn pin_open_conversation(&mut self) {
        if let Some(open) = self.session.open_conversation_id() {
            self.ledger.mark_read(open);
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connection(state) => self.on_connection(state),
            TransportEvent::Error(reason) => {
                warn!("Server reported: {}", reason);
                self.banner = Some(reason);
            }
            TransportEvent::Message {
                conversation_id,
                message,
            } => self.on_message(conversation_id, message).await,
            TransportEvent::Summary {
                participant_id,
                delta,
            } => {
                if participant_id != self.identity.participant_id {
                    debug!(participant = %participant_id, "Summary for another participant ignored");
                    return;
                }
                self.on_summary(delta);
            }
        }
    }

    fn on_connection(&mut self, state: ConnectionState) {
        debug!(?state, "Connection state");
        self.connection = state;
        match state {
            ConnectionState::Connected => {
                self.banner = None;
                self.reconnect_at = None;
            }
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected | ConnectionState::Error => {
                // Subscriptions died with the connection
                self.summary = None;
                self.session.connection_lost();
                self.banner = Some("Live updates unavailable, reconnecting".to_string());
                self.schedule_reconnect();
            }
        }
    }

    async fn on_message(&mut self, conversation_id: ConversationId, message: Message) {
        match self.session.on_message(message, self.api.as_ref()).await {
            AppendOutcome::Appended { acknowledged: true } => {
                self.ledger.mark_read(&conversation_id);
            }
            AppendOutcome::Appended { acknowledged: false } | AppendOutcome::Duplicate => {}
            AppendOutcome::NotOpen => {
                debug!(conversation = %conversation_id, "Message outside the open session dropped");
            }
        }
    }

    fn on_summary(&mut self, delta: ConversationSummaryDelta) {
        let known = self.directory.apply_summary_delta(&delta);
        if !known {
            // Counted once a pull lists it
            debug!(conversation = %delta.conversation_id, "Delta for unlisted conversation not counted");
        } else if !self.directory.is_chattable(&delta.conversation_id) {
            debug!(conversation = %delta.conversation_id, "Delta for closed conversation not counted");
        } else {
            self.ledger.on_delta(
                &delta,
                self.session.open_conversation_id(),
                &self.identity.participant_id,
            );
        }
        self.recount_pending = true;
    }

    /// Pull the conversation list, then recount unread
    async fn reload(&mut self) -> Result<()> {
        let loaded = self.directory.load(self.api.as_ref()).await;
        if loaded.is_ok() {
            if let Some(latest) = self
                .session
                .conversation()
                .and_then(|c| self.directory.get(&c.conversation_id))
                .cloned()
            {
                self.session.refresh_conversation(&latest);
            }
            let directory = &self.directory;
            self.ledger
                .retain(|id| directory.get(id).is_some_and(Conversation::is_chattable));
        }
        self.resync_unread().await;
        loaded
    }

    /// Badge only. Live deltas between pulls belong to the ledger.
    async fn recount(&mut self) -> Recount {
        self.recount_pending = false;
        self.aggregate.recompute(self.api.as_ref()).await
    }

    /// Recount and take the fetched counts as the ledger's baseline
    async fn resync_unread(&mut self) {
        let recount = self.recount().await;
        let open = self.session.open_conversation_id();
        for (conversation, count) in &recount.counts {
            if open == Some(conversation.as_str()) {
                self.ledger.mark_read(conversation);
            } else {
                self.ledger.seed(conversation, *count);
            }
        }
    }

    #[instrument(skip(self))]
    async fn connect(&mut self) -> bool {
        if let Err(e) = self.transport.connect().await {
            warn!("Push channel unavailable: {}", e);
            self.banner = Some(format!("Live updates unavailable: {}", e));
            self.schedule_reconnect();
            return false;
        }
        self.connection = self.transport.state();
        self.banner = None;
        self.reconnect_at = None;
        self.attach_summary().await;
        self.session.attach(&self.transport).await;
        true
    }

    async fn attach_summary(&mut self) {
        if self.summary.is_some() {
            return;
        }
        let topic = Topic::Summary(self.identity.participant_id.clone());
        match self.transport.subscribe(topic).await {
            Ok(subscription) => self.summary = Some(subscription),
            Err(e) => {
                error!("Summary subscription failed: {}", e);
                self.banner = Some(format!("Live updates unavailable: {}", e));
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_none() {
            debug!(delay = ?self.config.reconnect_delay, "Reconnect scheduled");
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        }
    }

    /// Redial, resubscribe and re-pull everything the channel may have missed
    async fn reconnect(&mut self) {
        self.reconnect_at = None;
        info!("Reconnecting push channel");
        if !self.connect().await {
            return;
        }
        if let Err(e) = self.reload().await {
            warn!("Pull after reconnect failed: {}", e);
        }
        if let Err(e) = self
            .session
            .resume(self.api.as_ref(), &self.transport)
            .await
        {
            warn!("Catch-up pull failed: {}", e);
        }
        self.pin_open_conversation();
    }

    fn teardown(&mut self) {
        info!("Shutting down sync engine");
        self.session.close();
        if let Some(summary) = self.summary.take() {
            summary.unsubscribe();
        }
        self.aggregate.teardown();
        self.reconnect_at = None;
        self.transport.disconnect();
        self.connection = ConnectionState::Disconnected;
    }

    fn publish(&self) {
        self.badge_tx.send_replace(self.aggregate.badge().clone());
        self.snapshot_tx.send_replace(ChatSnapshot {
            connection: self.connection,
            banner: self.banner.clone(),
            directory: self.directory.status().clone(),
            conversations: self.directory.views(&self.ledger),
            session: self.session.view(),
            unread_total: self.ledger.total(),
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
