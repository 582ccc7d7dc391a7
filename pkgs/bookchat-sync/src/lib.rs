//! bookchat-sync - conversation list, unread counts and the open thread,
//! kept consistent across REST pulls and push events
//!
//! # Components
//!
//! - [`ConversationDirectory`]: the participant's conversations, sorted by
//!   recent activity; membership comes only from pulls
//! - [`UnreadLedger`]: canonical per-conversation unread counts,
//!   reconciled from pulls, summary deltas and local reads
//! - [`ActiveSession`]: the single open conversation, pinned at zero
//!   unread while open
//! - [`AggregateUnreadCounter`]: the badge total, recomputed in full
//! - [`SyncEngine`]: runs all of the above on one task and exposes a
//!   [`SyncHandle`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bookchat_sync::{HttpChatApi, Identity, Role, SyncConfig, SyncEngine};
//! use bookchat_transport::{TransportChannel, WsDialer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::load(None)?;
//! let api = Arc::new(HttpChatApi::new(&config)?);
//! let (transport, events) = TransportChannel::new(Arc::new(WsDialer::new(&config.ws_url)));
//!
//! let handle = SyncEngine::spawn(config, Identity::new("42", Role::Customer), api, transport, events);
//! let mut snapshots = handle.watch_snapshot();
//! while snapshots.changed().await.is_ok() {
//!     let snapshot = snapshots.borrow().clone();
//!     println!("{} conversation(s)", snapshot.conversations.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod api;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod http;
pub mod ledger;
pub mod session;

pub use aggregate::{sum_unread, AggregateUnreadCounter, Recount, UnreadBadge};
pub use api::{
    fetch_all_conversations, open_or_create_conversation, ChatApi, NewConversation, PageRequest,
    SendImage, SendText,
};
pub use config::SyncConfig;
pub use directory::{by_recent_activity, ConversationDirectory, ConversationView, DirectoryStatus};
pub use engine::{ChatSnapshot, Identity, Role, SyncEngine, SyncHandle};
pub use error::{Result, SyncError};
pub use http::HttpChatApi;
pub use ledger::{reconcile_delta, Reconciliation, UnreadLedger};
pub use session::{ActiveSession, AppendOutcome, SessionState, SessionView};
