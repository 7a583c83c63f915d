use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::backend::{PresenceBackend, RecordBackend, UserField};
use crate::error::{ChatError, ChatResult};
use crate::model::{Message, MessageId, UserId, UserRecord};
use crate::room::RoomKey;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id TEXT NOT NULL,
    room TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    ts INTEGER NOT NULL,
    seen_by TEXT NOT NULL DEFAULT '[]',
    deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, room)
);
CREATE INDEX IF NOT EXISTS messages_room_ts ON messages (room, ts);
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    online INTEGER NOT NULL DEFAULT 0,
    unread_from TEXT NOT NULL DEFAULT '[]',
    conversations TEXT NOT NULL DEFAULT '[]'
);
";

/// Durable backend over SQLite. Set-valued fields (`seen_by`,
/// `unread_from`, `conversations`) are stored as JSON arrays.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteBackend { pool }
    }

    pub async fn connect(url: &str) -> ChatResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(db_err)?;
        let backend = SqliteBackend { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    pub async fn migrate(&self) -> ChatResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn fetch_message(&self, room: &RoomKey, id: MessageId) -> ChatResult<Message> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id,sender,content,ts,seen_by FROM messages WHERE id=? AND room=? AND deleted=0",
        )
        .bind(id.to_string())
        .bind(room.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.ok_or(ChatError::NotFound)?.into_message()
    }
}

fn db_err(err: sqlx::Error) -> ChatError {
    ChatError::Backend(err.into())
}

fn json_err(err: serde_json::Error) -> ChatError {
    ChatError::Backend(err.into())
}

type MessageRow = (String, String, String, i64, String);

trait IntoMessage {
    fn into_message(self) -> ChatResult<Message>;
}

impl IntoMessage for MessageRow {
    fn into_message(self) -> ChatResult<Message> {
        let (id, sender, text, timestamp_ms, seen_by) = self;
        Ok(Message {
            id: Uuid::parse_str(&id).map_err(|e| ChatError::Backend(e.into()))?,
            sender,
            text,
            timestamp_ms,
            seen_by: serde_json::from_str(&seen_by).map_err(json_err)?,
        })
    }
}

#[async_trait]
impl RecordBackend for SqliteBackend {
    async fn append_record(&self, room: &RoomKey, message: &Message) -> ChatResult<()> {
        sqlx::query("INSERT INTO messages (id,room,sender,content,ts,seen_by) VALUES (?,?,?,?,?,?)")
            .bind(message.id.to_string())
            .bind(room.as_str())
            .bind(&message.sender)
            .bind(&message.text)
            .bind(message.timestamp_ms)
            .bind(serde_json::to_string(&message.seen_by).map_err(json_err)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn edit_record(&self, room: &RoomKey, id: MessageId, text: &str) -> ChatResult<Message> {
        let result = sqlx::query("UPDATE messages SET content=? WHERE id=? AND room=? AND deleted=0")
            .bind(text)
            .bind(id.to_string())
            .bind(room.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound);
        }
        self.fetch_message(room, id).await
    }

    async fn delete_record(&self, room: &RoomKey, id: MessageId) -> ChatResult<()> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM messages WHERE id=? AND room=?")
            .bind(id.to_string())
            .bind(room.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(ChatError::NotFound);
        }
        sqlx::query("UPDATE messages SET deleted=1 WHERE id=? AND room=?")
            .bind(id.to_string())
            .bind(room.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_seen_record(
        &self,
        room: &RoomKey,
        id: MessageId,
        viewer: &str,
    ) -> ChatResult<Message> {
        // read-modify-write; the store serializes mutations per room
        let mut message = self.fetch_message(room, id).await?;
        if message.seen_by.insert(viewer.to_owned()) {
            sqlx::query("UPDATE messages SET seen_by=? WHERE id=? AND room=?")
                .bind(serde_json::to_string(&message.seen_by).map_err(json_err)?)
                .bind(id.to_string())
                .bind(room.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(message)
    }

    async fn list_records(&self, room: &RoomKey) -> ChatResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,sender,content,ts,seen_by FROM messages \
             WHERE room=? AND deleted=0 ORDER BY ts ASC, rowid ASC",
        )
        .bind(room.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(IntoMessage::into_message).collect()
    }
}

#[async_trait]
impl PresenceBackend for SqliteBackend {
    async fn get_user(&self, id: &str) -> ChatResult<Option<UserRecord>> {
        let row: Option<(String, bool, String, String)> =
            sqlx::query_as("SELECT id,online,unread_from,conversations FROM users WHERE id=?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        match row {
            Some((id, online, unread_from, conversations)) => Ok(Some(UserRecord {
                id,
                online,
                unread_from: serde_json::from_str(&unread_from).map_err(json_err)?,
                conversations: serde_json::from_str(&conversations).map_err(json_err)?,
            })),
            None => Ok(None),
        }
    }

    async fn put_user(&self, record: &UserRecord) -> ChatResult<()> {
        sqlx::query("INSERT OR REPLACE INTO users (id,online,unread_from,conversations) VALUES (?,?,?,?)")
            .bind(&record.id)
            .bind(record.online)
            .bind(serde_json::to_string(&record.unread_from).map_err(json_err)?)
            .bind(serde_json::to_string(&record.conversations).map_err(json_err)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_user_field(&self, id: &str, field: UserField) -> ChatResult<()> {
        sqlx::query("INSERT OR IGNORE INTO users (id) VALUES (?)")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        let query = match field {
            UserField::Online(online) => {
                sqlx::query("UPDATE users SET online=? WHERE id=?").bind(online)
            }
            UserField::UnreadFrom(unread_from) => {
                sqlx::query("UPDATE users SET unread_from=? WHERE id=?")
                    .bind(serde_json::to_string(&unread_from).map_err(json_err)?)
            }
            UserField::Conversations(conversations) => {
                sqlx::query("UPDATE users SET conversations=? WHERE id=?")
                    .bind(serde_json::to_string(&conversations).map_err(json_err)?)
            }
        };
        query.bind(id).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn list_online(&self) -> ChatResult<BTreeSet<UserId>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM users WHERE online=1")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_ms;

    async fn backend() -> SqliteBackend {
        // single connection: every pool handle must see the same
        // in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let backend = SqliteBackend::new(pool);
        backend.migrate().await.unwrap();
        backend
    }

    fn message(sender: &str, text: &str, ts: i64) -> Message {
        Message {
            id: Uuid::now_v7(),
            sender: sender.to_owned(),
            text: text.to_owned(),
            timestamp_ms: ts,
            seen_by: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn messages_round_trip_in_order() {
        let backend = backend().await;
        let room = RoomKey::direct("alice", "bob");
        let ts = now_ms();
        let first = message("alice", "hi", ts);
        let second = message("bob", "hey", ts); // same millisecond
        backend.append_record(&room, &first).await.unwrap();
        backend.append_record(&room, &second).await.unwrap();

        let listed = backend.list_records(&room).await.unwrap();
        assert_eq!(listed, vec![first.clone(), second]);

        let edited = backend.edit_record(&room, first.id, "hi there").await.unwrap();
        assert_eq!(edited.text, "hi there");
        assert_eq!(edited.timestamp_ms, ts);

        backend.delete_record(&room, first.id).await.unwrap();
        backend.delete_record(&room, first.id).await.unwrap();
        assert_eq!(backend.list_records(&room).await.unwrap().len(), 1);
        assert!(matches!(
            backend.edit_record(&room, first.id, "zombie").await,
            Err(ChatError::NotFound)
        ));
    }

    #[tokio::test]
    async fn seen_by_survives_as_a_set() {
        let backend = backend().await;
        let room = RoomKey::public();
        let msg = message("alice", "hello", now_ms());
        backend.append_record(&room, &msg).await.unwrap();

        backend.mark_seen_record(&room, msg.id, "bob").await.unwrap();
        let marked = backend.mark_seen_record(&room, msg.id, "bob").await.unwrap();
        assert_eq!(marked.seen_by.len(), 1);
        assert!(marked.seen_by.contains("bob"));
    }

    #[tokio::test]
    async fn user_fields_update_independently() {
        let backend = backend().await;
        backend.set_user_field("bob", UserField::Online(true)).await.unwrap();
        backend
            .set_user_field("bob", UserField::UnreadFrom(BTreeSet::from(["alice".to_owned()])))
            .await
            .unwrap();

        let record = backend.get_user("bob").await.unwrap().unwrap();
        assert!(record.online);
        assert!(record.unread_from.contains("alice"));
        assert!(record.conversations.is_empty());
        assert!(backend.list_online().await.unwrap().contains("bob"));
    }
}
