//! Conversation directory - the participant's conversation list
//!
//! Membership comes only from [`ConversationDirectory::load`]. Summary
//! deltas enrich conversations that are already known and are otherwise
//! ignored, so a late or malformed event never creates an entry.

use std::cmp::Ordering;
use std::collections::HashSet;

use bookchat_transport::{Conversation, ConversationSummaryDelta, ParticipantId};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::api::{fetch_all_conversations, ChatApi};
use crate::error::Result;
use crate::ledger::UnreadLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DirectoryStatus {
    /// Nothing loaded yet
    Empty,
    Ready,
    /// Last load failed; call `load` again to retry
    Failed(String),
}

/// A visible conversation paired with the ledger's count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub unread: u32,
}

pub struct ConversationDirectory {
    participant_id: ParticipantId,
    page_size: u32,
    max_pages: u32,
    /// Kept in load order; that order breaks timestamp ties
    conversations: Vec<Conversation>,
    status: DirectoryStatus,
}

impl ConversationDirectory {
    pub fn new(participant_id: impl Into<ParticipantId>, page_size: u32, max_pages: u32) -> Self {
        Self {
            participant_id: participant_id.into(),
            page_size,
            max_pages,
            conversations: Vec::new(),
            status: DirectoryStatus::Empty,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn status(&self) -> &DirectoryStatus {
        &self.status
    }

    /// Pull the full list and replace local state.
    ///
    /// On failure the previous list is discarded and the status carries
    /// the reason.
    #[instrument(skip(self, api), fields(participant = %self.participant_id))]
    pub async fn load(&mut self, api: &dyn ChatApi) -> Result<()> {
        let fetched = fetch_all_conversations(
            api,
            &self.participant_id,
            self.page_size,
            self.max_pages,
        )
        .await;

        match fetched {
            Ok(conversations) => {
                self.replace(conversations);
                info!("Loaded {} conversation(s)", self.conversations.len());
                Ok(())
            }
            Err(e) => {
                warn!("Conversation list pull failed: {}", e);
                self.conversations.clear();
                self.status = DirectoryStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Install a freshly pulled list, dropping repeated ids
    pub fn replace(&mut self, conversations: Vec<Conversation>) {
        let mut seen = HashSet::new();
        self.conversations = conversations
            .into_iter()
            .filter(|c| seen.insert(c.conversation_id.clone()))
            .collect();
        self.status = DirectoryStatus::Ready;
    }

    /// Merge a delta into a known conversation. Returns false when the
    /// conversation is unknown and the delta was ignored.
    pub fn apply_summary_delta(&mut self, delta: &ConversationSummaryDelta) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.conversation_id == delta.conversation_id)
        else {
            debug!(conversation = %delta.conversation_id, "Delta for unknown conversation ignored");
            return false;
        };

        if delta.last_message.is_some() {
            conversation.last_message = delta.last_message.clone();
        }
        if delta.last_message_time.is_some() {
            conversation.last_message_time = delta.last_message_time;
        }
        true
    }

    pub fn get(&self, conversation: &str) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|c| c.conversation_id == conversation)
    }

    /// All known conversations in load order, chattable or not
    pub fn all(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Chattable conversations, newest activity first
    pub fn visible_conversations(&self) -> Vec<&Conversation> {
        let mut visible: Vec<&Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.is_chattable())
            .collect();
        // sort_by is stable: equal timestamps keep load order
        visible.sort_by(|a, b| by_recent_activity(a, b));
        visible
    }

    /// Visible conversations with the ledger's unread counts
    pub fn views(&self, ledger: &UnreadLedger) -> Vec<ConversationView> {
        self.visible_conversations()
            .into_iter()
            .map(|c| {
                let unread = ledger.count(&c.conversation_id);
                let mut conversation = c.clone();
                conversation.unread_count = unread;
                ConversationView {
                    conversation,
                    unread,
                }
            })
            .collect()
    }

    pub fn is_chattable(&self, conversation: &str) -> bool {
        self.get(conversation).is_some_and(Conversation::is_chattable)
    }
}

/// Descending by last message time; conversations without one go last
pub fn by_recent_activity(a: &Conversation, b: &Conversation) -> Ordering {
    match (a.last_message_time, b.last_message_time) {
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookchat_transport::ParticipantProfile;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(secs, 0).single()
    }

    fn conversation(id: &str, time: Option<DateTime<Utc>>, can_chat: bool) -> Conversation {
        Conversation {
            conversation_id: id.to_string(),
            customer: ParticipantProfile {
                id: "cust".to_string(),
                name: "Customer".to_string(),
                avatar_url: None,
            },
            employee: ParticipantProfile {
                id: "emp".to_string(),
                name: "Employee".to_string(),
                avatar_url: None,
            },
            booking_id: None,
            last_message: None,
            last_message_time: time,
            is_active: true,
            can_chat,
            unread_count: 0,
        }
    }

    fn ids(list: Vec<&Conversation>) -> Vec<&str> {
        list.into_iter().map(|c| c.conversation_id.as_str()).collect()
    }

    #[test]
    fn test_sort_newest_first_untimed_last() {
        let mut directory = ConversationDirectory::new("cust", 100, 1);
        directory.replace(vec![
            conversation("A", at(100), true),
            conversation("B", at(200), true),
            conversation("C", None, true),
        ]);
        assert_eq!(ids(directory.visible_conversations()), vec!["B", "A", "C"]);
    }

    #[test]
    fn test_equal_timestamps_keep_load_order() {
        let mut directory = ConversationDirectory::new("cust", 100, 1);
        directory.replace(vec![
            conversation("first", at(50), true),
            conversation("untimed1", None, true),
            conversation("second", at(50), true),
            conversation("untimed2", None, true),
        ]);
        assert_eq!(
            ids(directory.visible_conversations()),
            vec!["first", "second", "untimed1", "untimed2"]
        );
    }

    #[test]
    fn test_non_chattable_hidden() {
        let mut directory = ConversationDirectory::new("cust", 100, 1);
        directory.replace(vec![
            conversation("convA", at(10), false),
            conversation("convB", at(5), true),
        ]);
        assert_eq!(ids(directory.visible_conversations()), vec!["convB"]);
        assert!(directory.get("convA").is_some());
    }

    #[test]
    fn test_unknown_delta_does_not_create_entry() {
        let mut directory = ConversationDirectory::new("cust", 100, 1);
        directory.replace(vec![conversation("known", None, true)]);

        let applied = directory.apply_summary_delta(&ConversationSummaryDelta {
            conversation_id: "ghost".to_string(),
            sender_id: "x".to_string(),
            last_message: Some("boo".to_string()),
            last_message_time: at(999),
            unread_count: Some(1),
        });
        assert!(!applied);
        assert_eq!(directory.all().len(), 1);
        assert!(directory.get("ghost").is_none());
    }

    #[test]
    fn test_delta_moves_conversation_to_top() {
        let mut directory = ConversationDirectory::new("cust", 100, 1);
        directory.replace(vec![
            conversation("A", at(100), true),
            conversation("B", at(200), true),
        ]);

        directory.apply_summary_delta(&ConversationSummaryDelta {
            conversation_id: "A".to_string(),
            sender_id: "emp".to_string(),
            last_message: Some("new".to_string()),
            last_message_time: at(300),
            unread_count: None,
        });
        assert_eq!(ids(directory.visible_conversations()), vec!["A", "B"]);
        assert_eq!(directory.get("A").unwrap().last_message.as_deref(), Some("new"));
    }

    #[test]
    fn test_views_use_ledger_counts() {
        let mut directory = ConversationDirectory::new("cust", 100, 1);
        let mut advisory = conversation("A", at(1), true);
        advisory.unread_count = 42;
        directory.replace(vec![advisory]);

        let mut ledger = UnreadLedger::new();
        ledger.seed("A", 2);

        let views = directory.views(&ledger);
        assert_eq!(views[0].unread, 2);
        assert_eq!(views[0].conversation.unread_count, 2);
    }

    #[test]
    fn test_replace_drops_repeated_ids() {
        let mut directory = ConversationDirectory::new("cust", 100, 1);
        directory.replace(vec![
            conversation("A", at(1), true),
            conversation("A", at(2), true),
        ]);
        assert_eq!(directory.all().len(), 1);
        assert_eq!(directory.status(), &DirectoryStatus::Ready);
    }
}
