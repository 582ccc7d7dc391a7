//! Topic naming for the push channel
//!
//! Two shapes exist: a per-conversation topic carrying individual
//! messages, and a per-participant topic carrying conversation summaries.

use std::fmt;

use crate::models::{ConversationId, ParticipantId};

const CONVERSATION_PREFIX: &str = "/topic/conversation/";
const USER_PREFIX: &str = "/topic/user/";
const SUMMARY_SUFFIX: &str = "/conversations";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Live messages of one conversation
    Conversation(ConversationId),
    /// Summary deltas for every conversation of one participant
    Summary(ParticipantId),
}

impl Topic {
    /// Destination string used on the wire
    pub fn destination(&self) -> String {
        match self {
            Topic::Conversation(id) => format!("{}{}", CONVERSATION_PREFIX, id),
            Topic::Summary(participant) => {
                format!("{}{}{}", USER_PREFIX, participant, SUMMARY_SUFFIX)
            }
        }
    }

    /// Inverse of [`Topic::destination`]
    pub fn parse(destination: &str) -> Option<Topic> {
        if let Some(id) = destination.strip_prefix(CONVERSATION_PREFIX) {
            if !id.is_empty() && !id.contains('/') {
                return Some(Topic::Conversation(id.to_string()));
            }
            return None;
        }

        let participant = destination
            .strip_prefix(USER_PREFIX)?
            .strip_suffix(SUMMARY_SUFFIX)?;
        if participant.is_empty() || participant.contains('/') {
            return None;
        }
        Some(Topic::Summary(participant.to_string()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}
