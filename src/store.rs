use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::backend::RecordBackend;
use crate::error::{ChatError, ChatResult};
use crate::model::{Message, MessageId, Snapshot, now_ms};
use crate::room::RoomKey;

/// Append-only ordered message log per room.
///
/// Mutations within one room are serialized by a per-room lock so the
/// (timestamp, arrival) order is a strict total order; different rooms
/// proceed in parallel. Every committed mutation emits the room key on
/// a broadcast channel; commit never blocks on subscriber delivery.
pub struct MessageStore {
    backend: Arc<dyn RecordBackend>,
    rooms: StdMutex<HashMap<RoomKey, Arc<Mutex<RoomTail>>>>,
    commits: broadcast::Sender<RoomKey>,
}

#[derive(Default)]
struct RoomTail {
    primed: bool,
    last_ts: i64,
}

impl MessageStore {
    pub fn new(backend: Arc<dyn RecordBackend>) -> Self {
        MessageStore {
            backend,
            rooms: StdMutex::new(HashMap::new()),
            commits: broadcast::channel(256).0,
        }
    }

    /// Stream of room keys, one event per committed mutation.
    pub fn watch_commits(&self) -> broadcast::Receiver<RoomKey> {
        self.commits.subscribe()
    }

    fn room_tail(&self, room: &RoomKey) -> Arc<Mutex<RoomTail>> {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.entry(room.clone()).or_default().clone()
    }

    fn commit(&self, room: &RoomKey) {
        tracing::debug!(room = %room, "commit");
        let _ = self.commits.send(room.clone());
    }

    pub async fn append(&self, room: &RoomKey, sender: &str, text: &str) -> ChatResult<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let tail = self.room_tail(room);
        let mut tail = tail.lock().await;
        if !tail.primed {
            // first touch since startup: recover the room's tail timestamp
            let existing = self.backend.list_records(room).await?;
            tail.last_ts = existing.last().map(|m| m.timestamp_ms).unwrap_or(0);
            tail.primed = true;
        }
        let message = Message {
            id: Uuid::now_v7(),
            sender: sender.to_owned(),
            text: text.to_owned(),
            timestamp_ms: now_ms().max(tail.last_ts),
            seen_by: BTreeSet::new(),
        };
        self.backend.append_record(room, &message).await?;
        tail.last_ts = message.timestamp_ms;
        drop(tail);
        self.commit(room);
        Ok(message)
    }

    /// Replaces the text only; id and timestamp (and therefore the
    /// message's position in the ordering) are preserved.
    pub async fn edit(&self, room: &RoomKey, id: MessageId, text: &str) -> ChatResult<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let tail = self.room_tail(room);
        let _guard = tail.lock().await;
        let message = self.backend.edit_record(room, id, text).await?;
        drop(_guard);
        self.commit(room);
        Ok(message)
    }

    pub async fn delete(&self, room: &RoomKey, id: MessageId) -> ChatResult<()> {
        let tail = self.room_tail(room);
        let _guard = tail.lock().await;
        self.backend.delete_record(room, id).await?;
        drop(_guard);
        self.commit(room);
        Ok(())
    }

    pub async fn mark_seen(&self, room: &RoomKey, id: MessageId, viewer: &str) -> ChatResult<Message> {
        let tail = self.room_tail(room);
        let _guard = tail.lock().await;
        let message = self.backend.mark_seen_record(room, id, viewer).await?;
        drop(_guard);
        self.commit(room);
        Ok(message)
    }

    /// Full restartable snapshot, ascending (timestamp, arrival).
    pub async fn list(&self, room: &RoomKey) -> ChatResult<Snapshot> {
        self.backend.list_records(room).await
    }
}
