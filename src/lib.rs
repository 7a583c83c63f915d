//! Real-time conversation messaging core.
//!
//! Rooms are derived keys ([`RoomKey`]), messages live in an ordered
//! per-room log ([`MessageStore`]) above a pluggable persistence
//! backend, presence and unread markers are tracked by
//! [`PresenceRegistry`], and [`SubscriptionHub`] pushes ordered
//! snapshots to every session watching a room. A UI layer drives all
//! of it through [`ConversationSession`].

pub mod backend;
pub mod error;
pub mod hub;
pub mod model;
pub mod presence;
pub mod room;
pub mod session;
pub mod sqlite;
pub mod store;

pub use backend::{MemoryBackend, PresenceBackend, RecordBackend, UserField};
pub use error::{ChatError, ChatResult};
pub use hub::{SubscriptionHandle, SubscriptionHub};
pub use model::{Message, MessageId, Snapshot, UserId, UserRecord};
pub use presence::PresenceRegistry;
pub use room::{PUBLIC_ROOM, RoomKey};
pub use session::{ChatContext, ConversationSession, OnlineUser, PUBLIC_CONVERSATION};
pub use sqlite::SqliteBackend;
pub use store::MessageStore;
