//! Aggregate unread counter - the cross-conversation badge total
//!
//! The total is always a full recomputation: list the participant's
//! conversations, fetch every chattable conversation's unread count and
//! sum. It runs on activation, on a fixed interval and whenever a summary
//! delta arrives. A conversation whose count fails to load contributes
//! zero for that cycle.

use std::time::Duration;

use bookchat_transport::{Conversation, ConversationId, ParticipantId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::api::{fetch_all_conversations, ChatApi};

/// Badge state published to the rest of the application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadBadge {
    pub total: u32,
    pub loading: bool,
    pub error: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Result of one recomputation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recount {
    pub total: u32,
    /// Authoritative counts that loaded successfully
    pub counts: Vec<(ConversationId, u32)>,
    /// Conversations whose count failed and contributed zero
    pub failed: Vec<ConversationId>,
}

pub struct AggregateUnreadCounter {
    participant_id: ParticipantId,
    page_size: u32,
    max_pages: u32,
    period: Duration,
    badge: UnreadBadge,
    refresh: Option<Interval>,
}

impl AggregateUnreadCounter {
    pub fn new(
        participant_id: impl Into<ParticipantId>,
        page_size: u32,
        max_pages: u32,
        period: Duration,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            page_size,
            max_pages,
            period,
            badge: UnreadBadge::default(),
            refresh: None,
        }
    }

    pub fn badge(&self) -> &UnreadBadge {
        &self.badge
    }

    pub fn total(&self) -> u32 {
        self.badge.total
    }

    pub fn is_active(&self) -> bool {
        self.refresh.is_some()
    }

    /// Start the refresh timer. The first tick fires one period from now;
    /// the caller runs the activation recount itself.
    pub fn activate(&mut self) {
        if self.refresh.is_some() {
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.refresh = Some(interval);
        debug!(period = ?self.period, "Unread refresh timer started");
    }

    /// Stop the refresh timer
    pub fn teardown(&mut self) {
        if self.refresh.take().is_some() {
            debug!("Unread refresh timer cleared");
        }
    }

    /// Resolves on the next refresh tick; never resolves while inactive
    pub async fn tick(&mut self) {
        match self.refresh.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    #[instrument(skip_all, fields(participant = %self.participant_id))]
    pub async fn recompute(&mut self, api: &dyn ChatApi) -> Recount {
        self.badge.loading = true;

        let conversations = match fetch_all_conversations(
            api,
            &self.participant_id,
            self.page_size,
            self.max_pages,
        )
        .await
        {
            Ok(conversations) => conversations,
            Err(e) => {
                warn!("Unread recount aborted, conversation list failed: {}", e);
                self.badge.loading = false;
                self.badge.error = Some(e.to_string());
                return Recount {
                    total: self.badge.total,
                    ..Recount::default()
                };
            }
        };

        let recount = sum_unread(api, &self.participant_id, &conversations).await;
        info!(
            total = recount.total,
            failed = recount.failed.len(),
            "Unread recount finished"
        );
        self.badge = UnreadBadge {
            total: recount.total,
            loading: false,
            error: None,
            refreshed_at: Some(Utc::now()),
        };
        recount
    }
}

/// Fetch every chattable conversation's count concurrently and sum them.
/// Failures are logged and count as zero.
pub async fn sum_unread(
    api: &dyn ChatApi,
    participant: &str,
    conversations: &[Conversation],
) -> Recount {
    let chattable: Vec<&Conversation> = conversations.iter().filter(|c| c.is_chattable()).collect();
    let results = join_all(
        chattable
            .iter()
            .map(|c| api.unread_count(&c.conversation_id, participant)),
    )
    .await;

    let mut recount = Recount::default();
    for (conversation, result) in chattable.into_iter().zip(results) {
        match result {
            Ok(count) => {
                recount.total = recount.total.saturating_add(count);
                recount
                    .counts
                    .push((conversation.conversation_id.clone(), count));
            }
            Err(e) => {
                warn!(
                    conversation = %conversation.conversation_id,
                    "Unread count failed, counting zero: {}", e
                );
                recount.failed.push(conversation.conversation_id.clone());
            }
        }
    }
    recount
}
