use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;
pub type MessageId = Uuid;

/// One chat message. `id` and `sender` are fixed at creation; `text`
/// may be replaced by an edit; `seen_by` only ever grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub text: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub seen_by: BTreeSet<UserId>,
}

/// Persisted per-user state: online flag, set of senders with messages
/// this user has not viewed yet, and the opened-conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub online: bool,
    #[serde(default)]
    pub unread_from: BTreeSet<UserId>,
    #[serde(default)]
    pub conversations: Vec<UserId>,
}

impl UserRecord {
    pub fn new(id: impl Into<UserId>) -> Self {
        UserRecord {
            id: id.into(),
            online: false,
            unread_from: BTreeSet::new(),
            conversations: Vec::new(),
        }
    }
}

/// Full ordered message list of one room at a point in time.
pub type Snapshot = Vec<Message>;

pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
