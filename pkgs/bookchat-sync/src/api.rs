//! Pull side: the REST endpoints the sync engine consumes

use async_trait::async_trait;
use bookchat_transport::{
    BookingId, Conversation, ConversationId, Message, Page, ParticipantId,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SyncError};

/// Zero-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn first(size: u32) -> Self {
        Self { page: 0, size }
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendText {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendImage {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub file_name: String,
    pub data: Bytes,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub customer_id: ParticipantId,
    pub employee_id: ParticipantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
}

/// REST operations used by the sync engine.
///
/// Sends resolve once the server accepted the message; the message itself
/// comes back over the conversation topic.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Conversations of `participant`
    async fn list_conversations(
        &self,
        participant: &str,
        page: PageRequest,
    ) -> Result<Page<Conversation>>;

    /// Messages of a conversation, newest first
    async fn list_messages(&self, conversation: &str, page: PageRequest) -> Result<Page<Message>>;

    async fn unread_count(&self, conversation: &str, participant: &str) -> Result<u32>;

    /// Idempotent
    async fn mark_read(&self, conversation: &str, participant: &str) -> Result<()>;

    async fn send_text(&self, request: SendText) -> Result<()>;

    async fn send_image(&self, request: SendImage) -> Result<()>;

    /// Fails with [`SyncError::Conflict`] when the booking already has one
    async fn create_conversation(&self, request: NewConversation) -> Result<Conversation>;

    async fn conversation_by_booking(&self, booking: &str) -> Result<Option<Conversation>>;
}

/// Create a conversation, or fetch the one that already exists for the
/// booking when the server reports a conflict.
pub async fn open_or_create_conversation(
    api: &dyn ChatApi,
    request: NewConversation,
) -> Result<Conversation> {
    let booking = request.booking_id.clone();
    match api.create_conversation(request).await {
        Ok(conversation) => {
            info!("Created conversation {}", conversation.conversation_id);
            Ok(conversation)
        }
        Err(SyncError::Conflict(reason)) => {
            let Some(booking) = booking else {
                return Err(SyncError::Conflict(reason));
            };
            info!("Conversation for booking {} exists, looking it up", booking);
            api.conversation_by_booking(&booking)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("conversation for booking {}", booking)))
        }
        Err(e) => Err(e),
    }
}

/// Pull every page of `participant`'s conversations, up to `max_pages`
pub async fn fetch_all_conversations(
    api: &dyn ChatApi,
    participant: &str,
    page_size: u32,
    max_pages: u32,
) -> Result<Vec<Conversation>> {
    let mut request = PageRequest::first(page_size);
    let mut all = Vec::new();
    for _ in 0..max_pages {
        let page = api.list_conversations(participant, request).await?;
        let last = page.is_last();
        all.extend(page.content);
        if last {
            break;
        }
        request = request.next();
    }
    Ok(all)
}
