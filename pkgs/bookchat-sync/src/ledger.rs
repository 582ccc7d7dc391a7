//! Unread ledger - the canonical per-conversation unread counts
//!
//! Counts come from three places: authoritative pulls ([`UnreadLedger::seed`]),
//! summary deltas from the push channel ([`UnreadLedger::on_delta`]) and
//! local read actions ([`UnreadLedger::mark_read`]). Nothing else writes to
//! the map.
//!
//! Deltas carry a server-suggested count that is unreliable under bursts.
//! The ledger never copies it; each foreign-sender delta adds exactly one.

use std::collections::HashMap;

use bookchat_transport::{ConversationId, ConversationSummaryDelta};
use tracing::debug;

/// What a single delta does to a conversation's count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The conversation is open, its count stays at zero
    PinnedToZero,
    /// Sent by the local participant, count unchanged
    IgnoredSelf,
    /// Foreign message in a closed conversation, new count
    Incremented(u32),
}

/// Reconciliation policy for one delta, evaluated in a fixed order:
/// open conversation first, then self-authored, then increment by one.
///
/// `current` is `None` when the ledger does not track the conversation yet.
pub fn reconcile_delta(
    current: Option<u32>,
    delta: &ConversationSummaryDelta,
    open_conversation: Option<&str>,
    local_participant: &str,
) -> Reconciliation {
    if open_conversation == Some(delta.conversation_id.as_str()) {
        return Reconciliation::PinnedToZero;
    }
    if delta.sender_id == local_participant {
        return Reconciliation::IgnoredSelf;
    }
    Reconciliation::Incremented(current.unwrap_or(0).saturating_add(1))
}

#[derive(Debug, Default, Clone)]
pub struct UnreadLedger {
    counts: HashMap<ConversationId, u32>,
}

impl UnreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a count from an authoritative pull
    pub fn seed(&mut self, conversation: &str, count: u32) {
        self.counts.insert(conversation.to_string(), count);
    }

    pub fn on_delta(
        &mut self,
        delta: &ConversationSummaryDelta,
        open_conversation: Option<&str>,
        local_participant: &str,
    ) -> Reconciliation {
        let current = self.counts.get(&delta.conversation_id).copied();
        let outcome = reconcile_delta(current, delta, open_conversation, local_participant);
        match outcome {
            Reconciliation::PinnedToZero => {
                self.counts.insert(delta.conversation_id.clone(), 0);
            }
            Reconciliation::IgnoredSelf => {}
            Reconciliation::Incremented(count) => {
                self.counts.insert(delta.conversation_id.clone(), count);
            }
        }
        debug!(
            conversation = %delta.conversation_id,
            advisory = ?delta.unread_count,
            ?outcome,
            "Applied summary delta"
        );
        outcome
    }

    /// Reset a conversation to zero. Idempotent.
    pub fn mark_read(&mut self, conversation: &str) {
        self.counts.insert(conversation.to_string(), 0);
    }

    /// Zero for untracked conversations
    pub fn count(&self, conversation: &str) -> u32 {
        self.counts.get(conversation).copied().unwrap_or(0)
    }

    pub fn is_tracked(&self, conversation: &str) -> bool {
        self.counts.contains_key(conversation)
    }

    /// Sum over every tracked conversation, recomputed on each call
    pub fn total(&self) -> u32 {
        self.counts
            .values()
            .fold(0u32, |sum, count| sum.saturating_add(*count))
    }

    /// Drop conversations for which `keep` returns false
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.counts.retain(|id, _| keep(id));
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
