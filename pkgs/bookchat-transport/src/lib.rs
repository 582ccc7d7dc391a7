//! bookchat-transport - the push side of bookchat conversation sync
//!
//! This crate owns the persistent connection to the chat server and turns
//! whatever arrives on it into typed events.
//!
//! # Topics
//!
//! - **Conversation topic**: individual [`Message`]s of one conversation,
//!   subscribed while that thread is open
//! - **Summary topic**: [`ConversationSummaryDelta`]s for every
//!   conversation of one participant, subscribed while the app is active
//!
//! # Events
//!
//! A [`TransportChannel`] has exactly one observer: the receiver returned
//! from [`TransportChannel::new`]. Connection state changes, server errors,
//! messages and summary deltas all arrive there as [`TransportEvent`]s.
//! Nothing is buffered or replayed across a reconnect; callers re-pull.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bookchat_transport::{Topic, TransportChannel, TransportEvent, WsDialer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (channel, mut events) =
//!     TransportChannel::new(Arc::new(WsDialer::new("ws://localhost:8080/ws")));
//! channel.connect().await?;
//! let subscription = channel.subscribe(Topic::Summary("42".into())).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::Summary { delta, .. } = event {
//!         println!("{} -> {:?}", delta.conversation_id, delta.last_message);
//!     }
//! }
//! subscription.unsubscribe();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod events;
pub mod frame;
pub mod loopback;
pub mod models;
pub mod topic;
pub mod ws;

pub use channel::{Subscription, TransportChannel};
pub use error::{Result, TransportError};
pub use events::TransportEvent;
pub use frame::{ClientFrame, Dialer, Link, ServerFrame};
pub use loopback::LoopbackServer;
pub use models::{
    BookingId, ConnectionState, Conversation, ConversationId, ConversationSummaryDelta, Message,
    MessageBody, MessageId, Page, ParticipantId, ParticipantProfile,
};
pub use topic::Topic;
pub use ws::WsDialer;
