use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ChatError, ChatResult};
use crate::model::{Message, MessageId, UserId, UserRecord};
use crate::room::RoomKey;

/// Durable storage for per-room message logs. The store above this
/// trait serializes mutations per room, so implementations may use
/// plain read-modify-write for `mark_seen_record`.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn append_record(&self, room: &RoomKey, message: &Message) -> ChatResult<()>;

    /// Replace the text of a live record. `NotFound` when the id is
    /// absent or already deleted.
    async fn edit_record(&self, room: &RoomKey, id: MessageId, text: &str) -> ChatResult<Message>;

    /// Tombstone a record. Repeat deletes of the same id succeed;
    /// an id that never existed is `NotFound`.
    async fn delete_record(&self, room: &RoomKey, id: MessageId) -> ChatResult<()>;

    /// Monotone insert into a record's seen-by set.
    async fn mark_seen_record(
        &self,
        room: &RoomKey,
        id: MessageId,
        viewer: &str,
    ) -> ChatResult<Message>;

    /// Live records ascending by (timestamp, arrival order).
    async fn list_records(&self, room: &RoomKey) -> ChatResult<Vec<Message>>;
}

/// Single mutable field of a user record; the backend creates the
/// record with defaults if the user has never been stored.
#[derive(Debug, Clone)]
pub enum UserField {
    Online(bool),
    UnreadFrom(BTreeSet<UserId>),
    Conversations(Vec<UserId>),
}

#[async_trait]
pub trait PresenceBackend: Send + Sync {
    async fn get_user(&self, id: &str) -> ChatResult<Option<UserRecord>>;

    async fn put_user(&self, record: &UserRecord) -> ChatResult<()>;

    async fn set_user_field(&self, id: &str, field: UserField) -> ChatResult<()>;

    async fn list_online(&self) -> ChatResult<BTreeSet<UserId>>;
}

/// In-process backend for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryBackend {
    rooms: Mutex<HashMap<RoomKey, RoomLog>>,
    users: Mutex<HashMap<UserId, UserRecord>>,
}

#[derive(Default)]
struct RoomLog {
    // arrival order; timestamps are non-decreasing so this is also
    // the (timestamp, arrival) order
    live: Vec<Message>,
    deleted: HashSet<MessageId>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn append_record(&self, room: &RoomKey, message: &Message) -> ChatResult<()> {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.entry(room.clone()).or_default().live.push(message.clone());
        Ok(())
    }

    async fn edit_record(&self, room: &RoomKey, id: MessageId, text: &str) -> ChatResult<Message> {
        let mut rooms = self.rooms.lock().unwrap();
        let log = rooms.get_mut(room).ok_or(ChatError::NotFound)?;
        let message = log
            .live
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(ChatError::NotFound)?;
        message.text = text.to_owned();
        Ok(message.clone())
    }

    async fn delete_record(&self, room: &RoomKey, id: MessageId) -> ChatResult<()> {
        let mut rooms = self.rooms.lock().unwrap();
        let log = rooms.get_mut(room).ok_or(ChatError::NotFound)?;
        if let Some(pos) = log.live.iter().position(|m| m.id == id) {
            log.live.remove(pos);
            log.deleted.insert(id);
            Ok(())
        } else if log.deleted.contains(&id) {
            Ok(())
        } else {
            Err(ChatError::NotFound)
        }
    }

    async fn mark_seen_record(
        &self,
        room: &RoomKey,
        id: MessageId,
        viewer: &str,
    ) -> ChatResult<Message> {
        let mut rooms = self.rooms.lock().unwrap();
        let log = rooms.get_mut(room).ok_or(ChatError::NotFound)?;
        let message = log
            .live
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(ChatError::NotFound)?;
        message.seen_by.insert(viewer.to_owned());
        Ok(message.clone())
    }

    async fn list_records(&self, room: &RoomKey) -> ChatResult<Vec<Message>> {
        let rooms = self.rooms.lock().unwrap();
        let mut records = match rooms.get(room) {
            Some(log) => log.live.clone(),
            None => Vec::new(),
        };
        // stable: arrival order breaks timestamp ties
        records.sort_by_key(|m| m.timestamp_ms);
        Ok(records)
    }
}

#[async_trait]
impl PresenceBackend for MemoryBackend {
    async fn get_user(&self, id: &str) -> ChatResult<Option<UserRecord>> {
        Ok(self.users.lock().unwrap().get(id).cloned())
    }

    async fn put_user(&self, record: &UserRecord) -> ChatResult<()> {
        self.users
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn set_user_field(&self, id: &str, field: UserField) -> ChatResult<()> {
        let mut users = self.users.lock().unwrap();
        let record = users
            .entry(id.to_owned())
            .or_insert_with(|| UserRecord::new(id));
        match field {
            UserField::Online(online) => record.online = online,
            UserField::UnreadFrom(unread_from) => record.unread_from = unread_from,
            UserField::Conversations(conversations) => record.conversations = conversations,
        }
        Ok(())
    }

    async fn list_online(&self) -> ChatResult<BTreeSet<UserId>> {
        let users = self.users.lock().unwrap();
        Ok(users
            .values()
            .filter(|u| u.online)
            .map(|u| u.id.clone())
            .collect())
    }
}
