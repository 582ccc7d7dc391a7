//! Active conversation session - the one thread currently open
//!
//! Lifecycle: `Idle -> Loading -> Ready -> Idle`. While open, the session
//! holds the conversation topic subscription, appends live messages in
//! arrival order and acknowledges foreign messages straight away so the
//! thread stays at zero unread.
//!
//! Sent messages are never appended here. They show up when the server
//! echoes them on the conversation topic.

use std::collections::HashSet;

use bookchat_transport::{
    Conversation, ConversationId, Message, MessageId, Page, ParticipantId, Subscription, Topic,
    TransportChannel,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::api::{ChatApi, PageRequest, SendImage, SendText};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Loading,
    Ready,
    /// Initial pull failed; `retry` opens the same conversation again
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { acknowledged: bool },
    Duplicate,
    /// No open session for that conversation; the message was dropped
    NotOpen,
}

/// Read-only snapshot of the session for rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub conversation: Conversation,
    pub state: SessionState,
    pub messages: Vec<Message>,
    pub can_compose: bool,
    pub live: bool,
    pub has_older: bool,
}

pub struct ActiveSession {
    local_participant: ParticipantId,
    page_size: u32,
    state: SessionState,
    conversation: Option<Conversation>,
    /// Oldest first
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    subscription: Option<Subscription>,
    next_page: u32,
    has_older: bool,
}

impl ActiveSession {
    pub fn new(local_participant: impl Into<ParticipantId>, page_size: u32) -> Self {
        Self {
            local_participant: local_participant.into(),
            page_size,
            state: SessionState::Idle,
            conversation: None,
            messages: Vec::new(),
            seen: HashSet::new(),
            subscription: None,
            next_page: 0,
            has_older: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// The conversation whose unread count is pinned at zero
    pub fn open_conversation_id(&self) -> Option<&str> {
        match self.state {
            SessionState::Loading | SessionState::Ready => self
                .conversation
                .as_ref()
                .map(|c| c.conversation_id.as_str()),
            SessionState::Idle | SessionState::Failed(_) => None,
        }
    }

    pub fn view(&self) -> Option<SessionView> {
        let conversation = self.conversation.clone()?;
        let can_compose = self.state == SessionState::Ready && conversation.is_chattable();
        Some(SessionView {
            conversation,
            state: self.state.clone(),
            messages: self.messages.clone(),
            can_compose,
            live: self.subscription.is_some(),
            has_older: self.has_older,
        })
    }

    /// Open `conversation`, closing whatever was open before.
    ///
    /// Pulls the newest page, subscribes to the conversation topic when the
    /// push channel is up, and marks the backlog read.
    #[instrument(skip_all, fields(conversation = %conversation.conversation_id))]
    pub async fn open(
        &mut self,
        conversation: Conversation,
        api: &dyn ChatApi,
        transport: &TransportChannel,
    ) -> Result<()> {
        if self.conversation.is_some() {
            self.close();
        }
        let conversation_id = conversation.conversation_id.clone();
        self.conversation = Some(conversation);
        self.state = SessionState::Loading;

        let page = match api
            .list_messages(&conversation_id, PageRequest::first(self.page_size))
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Message pull failed: {}", e);
                self.state = SessionState::Failed(e.to_string());
                return Err(e);
            }
        };
        self.install_page(page);

        self.attach(transport).await;
        self.acknowledge(api).await;
        self.state = SessionState::Ready;
        info!("Opened conversation with {} message(s)", self.messages.len());
        Ok(())
    }

    /// Re-open the current conversation after a failed pull
    pub async fn retry(&mut self, api: &dyn ChatApi, transport: &TransportChannel) -> Result<()> {
        let conversation = self.conversation.clone().ok_or(SyncError::NoOpenSession)?;
        self.open(conversation, api, transport).await
    }

    /// Unsubscribe first, then discard the thread
    pub fn close(&mut self) {
        self.detach();
        if let Some(conversation) = self.conversation.take() {
            debug!(conversation = %conversation.conversation_id, "Closed conversation");
        }
        self.messages.clear();
        self.seen.clear();
        self.next_page = 0;
        self.has_older = false;
        self.state = SessionState::Idle;
    }

    /// Subscribe to the open conversation's topic unless already subscribed.
    /// A subscribe failure leaves the session pull-only.
    pub async fn attach(&mut self, transport: &TransportChannel) {
        if self.subscription.is_some() {
            return;
        }
        let Some(conversation_id) = self.conversation.as_ref().map(|c| c.conversation_id.clone())
        else {
            return;
        };
        if !transport.is_connected() {
            debug!(conversation = %conversation_id, "Push channel down, session is pull-only");
            return;
        }
        match transport
            .subscribe(Topic::Conversation(conversation_id.clone()))
            .await
        {
            Ok(subscription) => {
                // The session may have moved on while the subscribe was in flight
                if self.is_open(&conversation_id) {
                    self.subscription = Some(subscription);
                } else {
                    subscription.unsubscribe();
                }
            }
            Err(e) => warn!(conversation = %conversation_id, "Live updates unavailable: {}", e),
        }
    }

    pub fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    /// Forget a subscription that died with its connection
    pub fn connection_lost(&mut self) {
        self.subscription = None;
    }

    /// After a reconnect: resubscribe, pull the newest page to close the
    /// gap and acknowledge it.
    pub async fn resume(&mut self, api: &dyn ChatApi, transport: &TransportChannel) -> Result<()> {
        let Some(conversation_id) = self.open_conversation_id().map(str::to_string) else {
            return Ok(());
        };
        self.attach(transport).await;
        let page = api
            .list_messages(&conversation_id, PageRequest::first(self.page_size))
            .await?;
        if !self.is_open(&conversation_id) {
            return Ok(());
        }
        let mut added = 0;
        for message in page.content.into_iter().rev() {
            if self.seen.insert(message.message_id.clone()) {
                self.messages.push(message);
                added += 1;
            }
        }
        debug!(conversation = %conversation_id, added, "Caught up after reconnect");
        self.acknowledge(api).await;
        Ok(())
    }

    /// Live message from the conversation topic
    pub async fn on_message(&mut self, message: Message, api: &dyn ChatApi) -> AppendOutcome {
        if self.state != SessionState::Ready || !self.is_open(&message.conversation_id) {
            debug!(conversation = %message.conversation_id, "Message for closed session dropped");
            return AppendOutcome::NotOpen;
        }
        if !self.seen.insert(message.message_id.clone()) {
            return AppendOutcome::Duplicate;
        }

        let foreign = !message.is_from(&self.local_participant);
        self.messages.push(message);
        if foreign {
            self.acknowledge(api).await;
        }
        AppendOutcome::Appended {
            acknowledged: foreign,
        }
    }

    /// Fetch the next older page and prepend it. Returns how many
    /// messages were added.
    pub async fn load_older(&mut self, api: &dyn ChatApi) -> Result<usize> {
        let conversation_id = self
            .open_conversation_id()
            .map(str::to_string)
            .ok_or(SyncError::NoOpenSession)?;
        if !self.has_older {
            return Ok(0);
        }

        let request = PageRequest {
            page: self.next_page,
            size: self.page_size,
        };
        let page = api.list_messages(&conversation_id, request).await?;
        if !self.is_open(&conversation_id) {
            return Ok(0);
        }

        self.has_older = !page.is_last();
        self.next_page += 1;
        let older: Vec<Message> = page
            .content
            .into_iter()
            .rev()
            .filter(|m| self.seen.insert(m.message_id.clone()))
            .collect();
        let added = older.len();
        self.messages.splice(0..0, older);
        Ok(added)
    }

    pub async fn send_text(&self, text: &str, api: &dyn ChatApi) -> Result<()> {
        let conversation_id = self.composable_conversation()?;
        let content = text.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        api.send_text(SendText {
            conversation_id,
            sender_id: self.local_participant.clone(),
            content: content.to_string(),
        })
        .await
    }

    pub async fn send_image(
        &self,
        file_name: String,
        data: Bytes,
        caption: Option<String>,
        api: &dyn ChatApi,
    ) -> Result<()> {
        let conversation_id = self.composable_conversation()?;
        if data.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        api.send_image(SendImage {
            conversation_id,
            sender_id: self.local_participant.clone(),
            file_name,
            data,
            caption: caption.filter(|c| !c.trim().is_empty()),
        })
        .await
    }

    /// Take a freshly pulled copy of the open conversation, e.g. after its
    /// booking completed and `can_chat` flipped.
    pub fn refresh_conversation(&mut self, latest: &Conversation) {
        if let Some(current) = self.conversation.as_mut() {
            if current.conversation_id == latest.conversation_id {
                *current = latest.clone();
            }
        }
    }

    fn composable_conversation(&self) -> Result<ConversationId> {
        let conversation = self.conversation.as_ref().ok_or(SyncError::NoOpenSession)?;
        if self.state != SessionState::Ready {
            return Err(SyncError::NoOpenSession);
        }
        if !conversation.is_chattable() {
            return Err(SyncError::ChatDisabled(conversation.conversation_id.clone()));
        }
        Ok(conversation.conversation_id.clone())
    }

    fn is_open(&self, conversation: &str) -> bool {
        self.conversation
            .as_ref()
            .is_some_and(|c| c.conversation_id == conversation)
    }

    fn install_page(&mut self, page: Page<Message>) {
        self.has_older = !page.is_last();
        self.next_page = 1;
        self.seen.clear();
        self.messages = page
            .content
            .into_iter()
            .rev()
            .filter(|m| self.seen.insert(m.message_id.clone()))
            .collect();
    }

    async fn acknowledge(&self, api: &dyn ChatApi) {
        let Some(conversation) = self.conversation.as_ref() else {
            return;
        };
        if let Err(e) = api
            .mark_read(&conversation.conversation_id, &self.local_participant)
            .await
        {
            warn!(conversation = %conversation.conversation_id, "Mark read failed: {}", e);
        }
    }
}
