use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};

use crate::backend::{PresenceBackend, UserField};
use crate::error::ChatResult;
use crate::model::{UserId, UserRecord};

/// Tracks who is online and who has unseen messages waiting.
///
/// Read-modify-write of user records goes through one registry-level
/// lock, so concurrent unread updates for different senders commute
/// instead of clobbering each other.
pub struct PresenceRegistry {
    backend: Arc<dyn PresenceBackend>,
    guard: Mutex<()>,
    online_tx: broadcast::Sender<BTreeSet<UserId>>,
}

impl PresenceRegistry {
    pub fn new(backend: Arc<dyn PresenceBackend>) -> Self {
        PresenceRegistry {
            backend,
            guard: Mutex::new(()),
            online_tx: broadcast::channel(64).0,
        }
    }

    /// Current online set, pushed whenever it changes.
    pub fn watch_online(&self) -> broadcast::Receiver<BTreeSet<UserId>> {
        self.online_tx.subscribe()
    }

    pub async fn set_online(&self, user: &str, online: bool) -> ChatResult<()> {
        let _guard = self.guard.lock().await;
        let previous = self.backend.get_user(user).await?;
        if previous.as_ref().map(|u| u.online) == Some(online) {
            return Ok(());
        }
        self.backend.set_user_field(user, UserField::Online(online)).await?;
        tracing::debug!(user, online, "presence change");
        let _ = self.online_tx.send(self.backend.list_online().await?);
        Ok(())
    }

    pub async fn list_online(&self) -> ChatResult<BTreeSet<UserId>> {
        self.backend.list_online().await
    }

    pub async fn add_unread(&self, recipient: &str, sender: &str) -> ChatResult<()> {
        let _guard = self.guard.lock().await;
        let mut unread = self.unread_set(recipient).await?;
        if unread.insert(sender.to_owned()) {
            self.backend
                .set_user_field(recipient, UserField::UnreadFrom(unread))
                .await?;
        }
        Ok(())
    }

    /// No-op when the sender is not in the recipient's unread set.
    pub async fn clear_unread(&self, recipient: &str, sender: &str) -> ChatResult<()> {
        let _guard = self.guard.lock().await;
        let mut unread = self.unread_set(recipient).await?;
        if unread.remove(sender) {
            self.backend
                .set_user_field(recipient, UserField::UnreadFrom(unread))
                .await?;
        }
        Ok(())
    }

    pub async fn unread_from(&self, recipient: &str) -> ChatResult<BTreeSet<UserId>> {
        self.unread_set(recipient).await
    }

    pub async fn conversations(&self, user: &str) -> ChatResult<Vec<UserId>> {
        Ok(self
            .backend
            .get_user(user)
            .await?
            .map(|u| u.conversations)
            .unwrap_or_default())
    }

    pub async fn set_conversations(&self, user: &str, conversations: Vec<UserId>) -> ChatResult<()> {
        let _guard = self.guard.lock().await;
        self.backend
            .set_user_field(user, UserField::Conversations(conversations))
            .await
    }

    pub async fn get_user(&self, id: &str) -> ChatResult<Option<UserRecord>> {
        self.backend.get_user(id).await
    }

    async fn unread_set(&self, recipient: &str) -> ChatResult<BTreeSet<UserId>> {
        Ok(self
            .backend
            .get_user(recipient)
            .await?
            .map(|u| u.unread_from)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn registry() -> Arc<PresenceRegistry> {
        Arc::new(PresenceRegistry::new(Arc::new(MemoryBackend::new())))
    }

    #[tokio::test]
    async fn online_set_tracks_status_changes() {
        let registry = registry();
        let mut watch = registry.watch_online();

        registry.set_online("alice", true).await.unwrap();
        registry.set_online("alice", true).await.unwrap(); // idempotent, no extra push
        registry.set_online("bob", true).await.unwrap();
        registry.set_online("alice", false).await.unwrap();

        assert_eq!(registry.list_online().await.unwrap(), BTreeSet::from(["bob".to_owned()]));
        assert_eq!(watch.recv().await.unwrap(), BTreeSet::from(["alice".to_owned()]));
        assert_eq!(
            watch.recv().await.unwrap(),
            BTreeSet::from(["alice".to_owned(), "bob".to_owned()])
        );
        assert_eq!(watch.recv().await.unwrap(), BTreeSet::from(["bob".to_owned()]));
    }

    #[tokio::test]
    async fn concurrent_unread_adds_both_land() {
        let registry = registry();
        let (a, b) = tokio::join!(
            registry.add_unread("dave", "bob"),
            registry.add_unread("dave", "carol"),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(
            registry.unread_from("dave").await.unwrap(),
            BTreeSet::from(["bob".to_owned(), "carol".to_owned()])
        );
    }

    #[tokio::test]
    async fn clearing_one_sender_keeps_the_others() {
        let registry = registry();
        registry.add_unread("dave", "bob").await.unwrap();
        registry.add_unread("dave", "carol").await.unwrap();
        registry.clear_unread("dave", "bob").await.unwrap();
        registry.clear_unread("dave", "bob").await.unwrap(); // absent: no-op
        assert_eq!(
            registry.unread_from("dave").await.unwrap(),
            BTreeSet::from(["carol".to_owned()])
        );
    }
}
