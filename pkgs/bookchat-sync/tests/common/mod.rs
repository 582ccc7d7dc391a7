//! Shared fixtures: an in-memory chat API and record builders
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookchat_sync::{
    ChatApi, ChatSnapshot, NewConversation, PageRequest, Result, SendImage, SendText, SyncError,
    SyncHandle,
};
use bookchat_transport::{
    Conversation, ConversationId, ConversationSummaryDelta, LoopbackServer, Message, MessageBody,
    Page, ParticipantId, ParticipantProfile, TransportChannel, TransportEvent,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

pub const CUSTOMER: &str = "cust-1";
pub const EMPLOYEE: &str = "emp-1";

#[derive(Default)]
struct MockState {
    conversations: Vec<Conversation>,
    /// Newest first, like the server
    messages: HashMap<ConversationId, Vec<Message>>,
    unread: HashMap<ConversationId, u32>,
    failing_unread: HashSet<ConversationId>,
    fail_list: bool,
    fail_messages: bool,
    fail_send: bool,
    conflict_on_create: bool,
    list_calls: usize,
    message_calls: usize,
    mark_read_calls: Vec<(ConversationId, ParticipantId)>,
    sent_text: Vec<SendText>,
    sent_images: Vec<SendImage>,
}

/// In-memory [`ChatApi`] with switchable failures and call recording
#[derive(Default)]
pub struct MockChatApi {
    state: Mutex<MockState>,
}

impl MockChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().conversations = conversations;
    }

    /// `messages` oldest first
    pub fn set_messages(&self, conversation: &str, mut messages: Vec<Message>) {
        messages.reverse();
        self.state
            .lock()
            .messages
            .insert(conversation.to_string(), messages);
    }

    /// Server-side arrival of a new message
    pub fn push_message(&self, message: Message) {
        self.state
            .lock()
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .insert(0, message);
    }

    pub fn set_unread(&self, conversation: &str, count: u32) {
        self.state.lock().unread.insert(conversation.to_string(), count);
    }

    pub fn fail_unread(&self, conversation: &str) {
        self.state
            .lock()
            .failing_unread
            .insert(conversation.to_string());
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    pub fn set_fail_messages(&self, fail: bool) {
        self.state.lock().fail_messages = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state.lock().fail_send = fail;
    }

    pub fn set_conflict_on_create(&self, conflict: bool) {
        self.state.lock().conflict_on_create = conflict;
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn message_calls(&self) -> usize {
        self.state.lock().message_calls
    }

    pub fn mark_read_calls(&self) -> Vec<(ConversationId, ParticipantId)> {
        self.state.lock().mark_read_calls.clone()
    }

    pub fn sent_text(&self) -> Vec<SendText> {
        self.state.lock().sent_text.clone()
    }

    pub fn sent_images(&self) -> Vec<SendImage> {
        self.state.lock().sent_images.clone()
    }
}

fn unavailable() -> SyncError {
    SyncError::Http {
        status: 503,
        body: "unavailable".to_string(),
    }
}

fn paginate<T: Clone>(items: &[T], request: PageRequest) -> Page<T> {
    let size = request.size.max(1) as usize;
    let start = (request.page as usize * size).min(items.len());
    let end = (start + size).min(items.len());
    Page {
        content: items[start..end].to_vec(),
        total_elements: items.len() as u64,
        total_pages: items.len().div_ceil(size) as u32,
        number: request.page,
        size: request.size,
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn list_conversations(
        &self,
        participant: &str,
        page: PageRequest,
    ) -> Result<Page<Conversation>> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.fail_list {
            return Err(unavailable());
        }
        let mine: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| c.involves(participant))
            .cloned()
            .collect();
        Ok(paginate(&mine, page))
    }

    async fn list_messages(&self, conversation: &str, page: PageRequest) -> Result<Page<Message>> {
        let mut state = self.state.lock();
        state.message_calls += 1;
        if state.fail_messages {
            return Err(unavailable());
        }
        let messages = state.messages.get(conversation).cloned().unwrap_or_default();
        Ok(paginate(&messages, page))
    }

    async fn unread_count(&self, conversation: &str, _participant: &str) -> Result<u32> {
        let state = self.state.lock();
        if state.failing_unread.contains(conversation) {
            return Err(unavailable());
        }
        Ok(state.unread.get(conversation).copied().unwrap_or(0))
    }

    async fn mark_read(&self, conversation: &str, participant: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .mark_read_calls
            .push((conversation.to_string(), participant.to_string()));
        state.unread.insert(conversation.to_string(), 0);
        Ok(())
    }

    async fn send_text(&self, request: SendText) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_send {
            return Err(unavailable());
        }
        state.sent_text.push(request);
        Ok(())
    }

    async fn send_image(&self, request: SendImage) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_send {
            return Err(unavailable());
        }
        state.sent_images.push(request);
        Ok(())
    }

    async fn create_conversation(&self, request: NewConversation) -> Result<Conversation> {
        let mut state = self.state.lock();
        if state.conflict_on_create {
            return Err(SyncError::Conflict("conversation already exists".to_string()));
        }
        let id = format!("conv-{}", state.conversations.len() + 1);
        let mut created = conversation(&id, Some(0), true);
        created.customer.id = request.customer_id;
        created.employee.id = request.employee_id;
        created.booking_id = request.booking_id;
        state.conversations.push(created.clone());
        Ok(created)
    }

    async fn conversation_by_booking(&self, booking: &str) -> Result<Option<Conversation>> {
        Ok(self
            .state
            .lock()
            .conversations
            .iter()
            .find(|c| c.booking_id.as_deref() == Some(booking))
            .cloned())
    }
}

/// Honours `RUST_LOG`; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

/// Conversation between [`CUSTOMER`] and [`EMPLOYEE`]
pub fn conversation(id: &str, last_activity: Option<i64>, can_chat: bool) -> Conversation {
    Conversation {
        conversation_id: id.to_string(),
        customer: ParticipantProfile {
            id: CUSTOMER.to_string(),
            name: "Casey".to_string(),
            avatar_url: None,
        },
        employee: ParticipantProfile {
            id: EMPLOYEE.to_string(),
            name: "Morgan".to_string(),
            avatar_url: None,
        },
        booking_id: None,
        last_message: last_activity.map(|_| "hello".to_string()),
        last_message_time: last_activity.map(at),
        is_active: true,
        can_chat,
        unread_count: 0,
    }
}

pub fn text_message(conversation: &str, id: &str, sender: &str, secs: i64) -> Message {
    Message {
        message_id: id.to_string(),
        conversation_id: conversation.to_string(),
        sender_id: sender.to_string(),
        sender_name: Some(sender.to_string()),
        sender_avatar: None,
        body: MessageBody::Text {
            content: format!("message {}", id),
        },
        is_read: false,
        created_at: at(secs),
    }
}

pub fn delta(conversation: &str, sender: &str, secs: i64) -> ConversationSummaryDelta {
    ConversationSummaryDelta {
        conversation_id: conversation.to_string(),
        sender_id: sender.to_string(),
        last_message: Some(format!("from {}", sender)),
        last_message_time: Some(at(secs)),
        unread_count: Some(99),
    }
}

/// Transport connected to a fresh loopback server, with the connection
/// events already drained
pub async fn connected_transport() -> (
    LoopbackServer,
    TransportChannel,
    UnboundedReceiver<TransportEvent>,
) {
    init_tracing();
    let server = LoopbackServer::new();
    let (transport, mut events) = TransportChannel::new(Arc::new(server.clone()));
    transport.connect().await.expect("Failed to connect");
    for _ in 0..2 {
        next_event(&mut events).await;
    }
    (server, transport, events)
}

pub async fn next_event(events: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("Timed out waiting for transport event")
        .expect("Event channel closed")
}

pub async fn wait_for_snapshot<F>(handle: &SyncHandle, predicate: F) -> ChatSnapshot
where
    F: FnMut(&ChatSnapshot) -> bool,
{
    let mut snapshots = handle.watch_snapshot();
    let snapshot = tokio::time::timeout(Duration::from_secs(3), snapshots.wait_for(predicate))
        .await
        .expect("Timed out waiting for snapshot")
        .expect("Engine stopped");
    (*snapshot).clone()
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
}
