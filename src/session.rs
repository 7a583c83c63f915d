use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use crate::backend::{PresenceBackend, RecordBackend};
use crate::error::{ChatError, ChatResult};
use crate::hub::{SubscriptionHandle, SubscriptionHub};
use crate::model::{Message, MessageId, Snapshot, UserId};
use crate::presence::PresenceRegistry;
use crate::room::RoomKey;
use crate::store::MessageStore;

/// Label under which the public room appears in a conversation list.
pub const PUBLIC_CONVERSATION: &str = "public";

/// Shared core components, constructed once at startup and handed to
/// every session. There is no process-wide singleton; integrators own
/// the context's lifetime.
pub struct ChatContext {
    pub store: Arc<MessageStore>,
    pub presence: Arc<PresenceRegistry>,
    pub hub: Arc<SubscriptionHub>,
}

impl ChatContext {
    pub fn new(
        records: Arc<dyn RecordBackend>,
        presence: Arc<dyn PresenceBackend>,
    ) -> Arc<Self> {
        let store = Arc::new(MessageStore::new(records));
        let hub = SubscriptionHub::new(store.clone());
        Arc::new(ChatContext {
            store,
            presence: Arc::new(PresenceRegistry::new(presence)),
            hub,
        })
    }

    /// Context over the in-process backend; handy for tests and demos.
    pub fn in_memory() -> Arc<Self> {
        let backend = Arc::new(crate::backend::MemoryBackend::new());
        Self::new(backend.clone(), backend)
    }
}

/// An online peer as shown in a session's user list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub id: UserId,
    pub has_unread: bool,
}

/// Per-client orchestration: one active room at a time, a visible
/// message list fed by hub pushes, and the user's conversation list.
pub struct ConversationSession {
    ctx: Arc<ChatContext>,
    user: UserId,
    state: Arc<StdMutex<SessionState>>,
}

struct SessionState {
    // bumped on every room switch and at logout; a push from a stale
    // subscription carries the old epoch and is dropped
    epoch: u64,
    partner: Option<UserId>,
    room: RoomKey,
    messages: Snapshot,
    conversations: Vec<UserId>,
    subscription: Option<SubscriptionHandle>,
    marked: HashSet<MessageId>,
    logged_in: bool,
}

impl ConversationSession {
    /// Marks the user online, loads their persisted conversation list
    /// and enters the public room.
    pub async fn login(ctx: Arc<ChatContext>, user: impl Into<UserId>) -> ChatResult<Self> {
        let user = user.into();
        ctx.presence.set_online(&user, true).await?;
        let conversations = ctx.presence.conversations(&user).await?;
        let session = ConversationSession {
            ctx,
            user: user.clone(),
            state: Arc::new(StdMutex::new(SessionState {
                epoch: 0,
                partner: None,
                room: RoomKey::public(),
                messages: Vec::new(),
                conversations,
                subscription: None,
                marked: HashSet::new(),
                logged_in: true,
            })),
        };
        tracing::debug!(user = %session.user, "session started");
        session.open_conversation(None).await?;
        Ok(session)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Switch the active room; `None` selects the public room. The
    /// previous subscription is cancelled before the new one activates,
    /// and the epoch bump keeps a late push from the old room out of
    /// the new room's view.
    pub async fn open_conversation(&self, partner: Option<&str>) -> ChatResult<()> {
        self.ensure_logged_in()?;
        if let Some(partner) = partner {
            let conversations = {
                let mut state = self.state.lock().unwrap();
                if state.conversations.iter().any(|c| c == partner) {
                    None
                } else {
                    state.conversations.push(partner.to_owned());
                    Some(state.conversations.clone())
                }
            };
            if let Some(conversations) = conversations {
                self.ctx.presence.set_conversations(&self.user, conversations).await?;
            }
            self.ctx.presence.clear_unread(&self.user, partner).await?;
        }

        let room = RoomKey::for_conversation(&self.user, partner);
        let (epoch, previous) = {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;
            state.partner = partner.map(str::to_owned);
            state.room = room.clone();
            state.messages.clear();
            state.marked.clear();
            (state.epoch, state.subscription.take())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        let callback = self.view_callback(epoch, room.clone(), partner.is_some());
        let handle = self.ctx.hub.subscribe(&room, callback).await;
        let mut state = self.state.lock().unwrap();
        if state.epoch == epoch && state.logged_in {
            state.subscription = Some(handle);
        } else {
            handle.cancel();
        }
        Ok(())
    }

    fn view_callback(
        &self,
        epoch: u64,
        room: RoomKey,
        private: bool,
    ) -> impl FnMut(Snapshot) + Send + 'static {
        let state = self.state.clone();
        let ctx = self.ctx.clone();
        let user = self.user.clone();
        move |snapshot: Snapshot| {
            let mut to_mark = Vec::new();
            {
                let mut state = state.lock().unwrap();
                if state.epoch != epoch {
                    return;
                }
                if private {
                    for message in &snapshot {
                        if message.sender != user
                            && !message.seen_by.contains(&user)
                            && state.marked.insert(message.id)
                        {
                            to_mark.push(message.id);
                        }
                    }
                }
                state.messages = snapshot;
            }
            for id in to_mark {
                let ctx = ctx.clone();
                let room = room.clone();
                let viewer = user.clone();
                tokio::spawn(async move {
                    if let Err(err) = ctx.store.mark_seen(&room, id, &viewer).await {
                        tracing::warn!(room = %room, message = %id, %err, "mark seen failed");
                    }
                });
            }
        }
    }

    /// Drops a partner from the conversation list; the public entry is
    /// implicit and cannot be removed. Falls back to the public room
    /// when the closed conversation was active.
    pub async fn close_conversation(&self, partner: &str) -> ChatResult<()> {
        self.ensure_logged_in()?;
        let (removed, was_active) = {
            let mut state = self.state.lock().unwrap();
            let position = state.conversations.iter().position(|c| c == partner);
            if let Some(position) = position {
                state.conversations.remove(position);
            }
            let was_active = state.partner.as_deref() == Some(partner);
            (position.map(|_| state.conversations.clone()), was_active)
        };
        if let Some(conversations) = removed {
            self.ctx.presence.set_conversations(&self.user, conversations).await?;
        }
        if was_active {
            self.open_conversation(None).await?;
        }
        Ok(())
    }

    /// Appends to the active room; in a private room the partner also
    /// gets this user added to their unread-from set.
    pub async fn send(&self, text: &str) -> ChatResult<Message> {
        self.ensure_logged_in()?;
        let (room, partner) = {
            let state = self.state.lock().unwrap();
            (state.room.clone(), state.partner.clone())
        };
        let message = self.ctx.store.append(&room, &self.user, text).await?;
        if let Some(partner) = partner {
            self.ctx.presence.add_unread(&partner, &self.user).await?;
        }
        Ok(message)
    }

    pub async fn edit_own(&self, id: MessageId, text: &str) -> ChatResult<Message> {
        self.ensure_logged_in()?;
        let room = self.active_room();
        self.ensure_owner(&room, id).await?;
        self.ctx.store.edit(&room, id, text).await
    }

    pub async fn delete_own(&self, id: MessageId) -> ChatResult<()> {
        self.ensure_logged_in()?;
        let room = self.active_room();
        self.ensure_owner(&room, id).await?;
        self.ctx.store.delete(&room, id).await
    }

    /// Offline, subscription cancelled, state cleared.
    pub async fn logout(&self) -> ChatResult<()> {
        let subscription = {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;
            state.logged_in = false;
            state.partner = None;
            state.messages.clear();
            state.marked.clear();
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.ctx.presence.set_online(&self.user, false).await?;
        tracing::debug!(user = %self.user, "session ended");
        Ok(())
    }

    /// Visible message list of the active room, as of the latest push.
    pub fn messages(&self) -> Snapshot {
        self.state.lock().unwrap().messages.clone()
    }

    /// Active chat partner; `None` means the public room.
    pub fn active_conversation(&self) -> Option<UserId> {
        self.state.lock().unwrap().partner.clone()
    }

    /// Conversation list as shown in the sidebar: public first, then
    /// opened partners in the order they were opened.
    pub fn conversations(&self) -> Vec<UserId> {
        let state = self.state.lock().unwrap();
        let mut all = Vec::with_capacity(state.conversations.len() + 1);
        all.push(PUBLIC_CONVERSATION.to_owned());
        all.extend(state.conversations.iter().cloned());
        all
    }

    /// Online peers (self excluded) with their has-unread flag.
    pub async fn online_users(&self) -> ChatResult<Vec<OnlineUser>> {
        let online = self.ctx.presence.list_online().await?;
        let unread = self.ctx.presence.unread_from(&self.user).await?;
        Ok(online
            .into_iter()
            .filter(|id| id != &self.user)
            .map(|id| OnlineUser {
                has_unread: unread.contains(&id),
                id,
            })
            .collect())
    }

    fn active_room(&self) -> RoomKey {
        self.state.lock().unwrap().room.clone()
    }

    fn ensure_logged_in(&self) -> ChatResult<()> {
        if self.state.lock().unwrap().logged_in {
            Ok(())
        } else {
            Err(ChatError::Forbidden)
        }
    }

    async fn ensure_owner(&self, room: &RoomKey, id: MessageId) -> ChatResult<()> {
        let listed = self.ctx.store.list(room).await?;
        let message = listed.iter().find(|m| m.id == id).ok_or(ChatError::NotFound)?;
        if message.sender != self.user {
            return Err(ChatError::Forbidden);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn only_the_sender_may_edit_or_delete() {
        let ctx = ChatContext::in_memory();
        let alice = ConversationSession::login(ctx.clone(), "alice").await.unwrap();
        let bob = ConversationSession::login(ctx.clone(), "bob").await.unwrap();

        let message = alice.send("mine").await.unwrap();
        assert!(matches!(
            bob.edit_own(message.id, "hijacked").await,
            Err(ChatError::Forbidden)
        ));
        assert!(matches!(bob.delete_own(message.id).await, Err(ChatError::Forbidden)));
        assert!(matches!(
            bob.edit_own(Uuid::now_v7(), "ghost").await,
            Err(ChatError::NotFound)
        ));

        let edited = alice.edit_own(message.id, "still mine").await.unwrap();
        assert_eq!(edited.text, "still mine");
        alice.delete_own(message.id).await.unwrap();
    }

    #[tokio::test]
    async fn closing_the_active_conversation_falls_back_to_public() {
        let ctx = ChatContext::in_memory();
        let alice = ConversationSession::login(ctx, "alice").await.unwrap();

        alice.open_conversation(Some("bob")).await.unwrap();
        assert_eq!(alice.active_conversation().as_deref(), Some("bob"));
        assert_eq!(alice.conversations(), vec!["public", "bob"]);

        alice.close_conversation("bob").await.unwrap();
        assert_eq!(alice.active_conversation(), None);
        assert_eq!(alice.conversations(), vec!["public"]);
    }

    #[tokio::test]
    async fn private_sends_flag_the_recipient() {
        let ctx = ChatContext::in_memory();
        let alice = ConversationSession::login(ctx.clone(), "alice").await.unwrap();
        let _bob = ConversationSession::login(ctx.clone(), "bob").await.unwrap();

        alice.open_conversation(Some("bob")).await.unwrap();
        alice.send("psst").await.unwrap();

        let unread = ctx.presence.unread_from("bob").await.unwrap();
        assert!(unread.contains("alice"));

        // public sends flag nobody
        alice.open_conversation(None).await.unwrap();
        alice.send("hello everyone").await.unwrap();
        assert_eq!(ctx.presence.unread_from("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn logged_out_sessions_are_inert() {
        let ctx = ChatContext::in_memory();
        let alice = ConversationSession::login(ctx.clone(), "alice").await.unwrap();
        alice.logout().await.unwrap();

        assert!(!ctx.presence.list_online().await.unwrap().contains("alice"));
        assert!(matches!(alice.send("anyone?").await, Err(ChatError::Forbidden)));
        assert!(matches!(alice.open_conversation(Some("bob")).await, Err(ChatError::Forbidden)));
    }

    #[tokio::test]
    async fn online_users_carry_the_unread_flag() {
        let ctx = ChatContext::in_memory();
        let alice = ConversationSession::login(ctx.clone(), "alice").await.unwrap();
        let bob = ConversationSession::login(ctx.clone(), "bob").await.unwrap();
        let _carol = ConversationSession::login(ctx.clone(), "carol").await.unwrap();

        alice.open_conversation(Some("bob")).await.unwrap();
        alice.send("knock knock").await.unwrap();

        let users = bob.online_users().await.unwrap();
        assert_eq!(users.len(), 2);
        let alice_entry = users.iter().find(|u| u.id == "alice").unwrap();
        assert!(alice_entry.has_unread);
        let carol_entry = users.iter().find(|u| u.id == "carol").unwrap();
        assert!(!carol_entry.has_unread);
    }
}
