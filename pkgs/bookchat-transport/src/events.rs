//! Events emitted by the transport channel

use crate::models::{
    ConnectionState, ConversationId, ConversationSummaryDelta, Message, ParticipantId,
};

/// Everything an observer of the push channel can receive.
///
/// Connection events may repeat the current state; observers must treat
/// them as idempotent.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connection(ConnectionState),
    Error(String),
    Message {
        conversation_id: ConversationId,
        message: Message,
    },
    Summary {
        participant_id: ParticipantId,
        delta: ConversationSummaryDelta,
    },
}
