//! Records shared by the pull (REST) and push (topic) paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ConversationId = String;
pub type ParticipantId = String;
pub type MessageId = String;
pub type BookingId = String;

/// Display identity of one side of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantProfile {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Conversation record as returned by the list endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub customer: ParticipantProfile,
    pub employee: ParticipantProfile,
    #[serde(default)]
    pub booking_id: Option<BookingId>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub can_chat: bool,
    /// Server-side count. Display code reads the ledger instead.
    #[serde(default)]
    pub unread_count: u32,
}

fn default_true() -> bool {
    true
}

impl Conversation {
    /// Whether new messages may still be composed here.
    ///
    /// A deactivated conversation is treated like one whose booking has
    /// reached a terminal state.
    pub fn is_chattable(&self) -> bool {
        self.can_chat && self.is_active
    }

    /// Profile of the side that is not `local`
    pub fn counterpart(&self, local: &str) -> &ParticipantProfile {
        if self.customer.id == local {
            &self.employee
        } else {
            &self.customer
        }
    }

    pub fn involves(&self, participant: &str) -> bool {
        self.customer.id == participant || self.employee.id == participant
    }
}

/// Payload of a message. The tag guarantees exactly one of text or image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum MessageBody {
    #[serde(rename = "TEXT")]
    Text { content: String },
    #[serde(rename = "IMAGE", rename_all = "camelCase")]
    Image { image_url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// One-line rendering used for list previews and terminal output
    pub fn preview(&self) -> String {
        match &self.body {
            MessageBody::Text { content } => content.clone(),
            MessageBody::Image { .. } => "[image]".to_string(),
        }
    }

    pub fn is_from(&self, participant: &str) -> bool {
        self.sender_id == participant
    }
}

/// Push-only summary of the latest activity in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummaryDelta {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    /// Server suggestion, known to be wrong under bursts
    #[serde(default)]
    pub unread_count: Option<u32>,
}

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Paged envelope used by the list endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub size: u32,
}

impl<T> Page<T> {
    pub fn single(content: Vec<T>) -> Self {
        let len = content.len();
        Self {
            content,
            total_elements: len as u64,
            total_pages: 1,
            number: 0,
            size: len as u32,
        }
    }

    /// True when no further page follows this one
    pub fn is_last(&self) -> bool {
        self.content.is_empty() || self.number + 1 >= self.total_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_decodes() {
        let json = r#"{
            "messageId": "m1",
            "conversationId": "c1",
            "senderId": "u1",
            "messageType": "TEXT",
            "content": "hello",
            "imageUrl": null,
            "isRead": false,
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg.body,
            MessageBody::Text {
                content: "hello".to_string()
            }
        );
        assert_eq!(msg.preview(), "hello");
    }

    #[test]
    fn test_image_message_requires_url() {
        let json = r#"{
            "messageId": "m2",
            "conversationId": "c1",
            "senderId": "u1",
            "messageType": "IMAGE",
            "content": null,
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn test_conversation_defaults() {
        let json = r#"{
            "conversationId": "c1",
            "customer": {"id": "cust", "name": "Ann"},
            "employee": {"id": "emp", "name": "Bo"}
        }"#;
        let conv: Conversation = serde_json::from_str(json).unwrap();
        assert!(conv.is_chattable());
        assert_eq!(conv.unread_count, 0);
        assert_eq!(conv.counterpart("cust").name, "Bo");
        assert_eq!(conv.counterpart("emp").name, "Ann");
    }

    #[test]
    fn test_page_is_last() {
        let page = Page {
            content: vec![1, 2],
            total_elements: 4,
            total_pages: 2,
            number: 0,
            size: 2,
        };
        assert!(!page.is_last());
        let empty: Page<u8> = Page::single(vec![]);
        assert!(empty.is_last());
    }
}
