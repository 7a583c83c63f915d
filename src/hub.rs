use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Notify, broadcast, watch};

use crate::model::Snapshot;
use crate::room::RoomKey;
use crate::store::MessageStore;

const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(5);

/// Pushes ordered room snapshots to subscribed sessions.
///
/// A pump task listens to the store's commit stream and publishes a
/// fresh snapshot into a per-room `watch` channel; each subscription
/// runs its callback on its own task fed by that channel. `watch`
/// keeps only the latest value, so rapid successive commits coalesce
/// into one delivery carrying the freshest snapshot, and deliveries
/// are never re-ordered relative to commit order.
pub struct SubscriptionHub {
    store: Arc<MessageStore>,
    rooms: StdMutex<HashMap<RoomKey, watch::Sender<Option<Snapshot>>>>,
}

/// Cancels the delivery of further snapshots. Idempotent, cheap to
/// clone, and safe to trigger from inside the subscription's own
/// callback.
#[derive(Clone)]
pub struct SubscriptionHandle {
    active: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl SubscriptionHub {
    pub fn new(store: Arc<MessageStore>) -> Arc<Self> {
        let hub = Arc::new(SubscriptionHub {
            store: store.clone(),
            rooms: StdMutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&hub);
        let mut commits = store.watch_commits();
        tokio::spawn(async move {
            loop {
                match commits.recv().await {
                    Ok(room) => {
                        let Some(hub) = weak.upgrade() else { break };
                        hub.refresh(&room).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "commit stream lagged, refreshing every room");
                        let Some(hub) = weak.upgrade() else { break };
                        hub.refresh_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        hub
    }

    /// Registers `callback` for `room`: invoked once with the current
    /// snapshot, then once per observed change (possibly coalesced)
    /// with a snapshot at-least-as-fresh as the triggering commit.
    pub async fn subscribe(
        &self,
        room: &RoomKey,
        callback: impl FnMut(Snapshot) + Send + 'static,
    ) -> SubscriptionHandle {
        let (tx, created) = {
            let mut rooms = self.rooms.lock().unwrap();
            match rooms.get(room) {
                Some(tx) => (tx.clone(), false),
                None => {
                    let (tx, _) = watch::channel(None);
                    rooms.insert(room.clone(), tx.clone());
                    (tx, true)
                }
            }
        };
        if created {
            let snapshot = self.snapshot_with_retry(room).await;
            // a concurrent commit may have filled the channel already;
            // never replace a fresher snapshot with the seed
            tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(snapshot);
                    true
                } else {
                    false
                }
            });
        }
        let mut rx = tx.subscribe();

        let handle = SubscriptionHandle {
            active: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        };
        let active = handle.active.clone();
        let notify = handle.notify.clone();
        let mut callback = callback;
        tokio::spawn(async move {
            let first = tokio::select! {
                _ = notify.notified() => return,
                first = rx.wait_for(|snapshot| snapshot.is_some()) => match first {
                    Ok(snapshot) => (*snapshot).clone().unwrap_or_default(),
                    Err(_) => return,
                },
            };
            if !active.load(Ordering::Acquire) {
                return;
            }
            callback(first);
            loop {
                if !active.load(Ordering::Acquire) {
                    return;
                }
                tokio::select! {
                    _ = notify.notified() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let snapshot = (*rx.borrow_and_update()).clone();
                        if !active.load(Ordering::Acquire) {
                            return;
                        }
                        if let Some(snapshot) = snapshot {
                            callback(snapshot);
                        }
                    }
                }
            }
        });
        handle
    }

    /// No-op when the handle was already cancelled.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.cancel();
    }

    async fn refresh(&self, room: &RoomKey) {
        let tx = { self.rooms.lock().unwrap().get(room).cloned() };
        let Some(tx) = tx else { return };
        let snapshot = self.snapshot_with_retry(room).await;
        tx.send_replace(Some(snapshot));
    }

    async fn refresh_all(&self) {
        let rooms: Vec<RoomKey> = { self.rooms.lock().unwrap().keys().cloned().collect() };
        for room in rooms {
            self.refresh(&room).await;
        }
    }

    /// Reads the room snapshot, retrying with jittered exponential
    /// backoff while the backend is unavailable. Delivery resumes from
    /// current state once the read succeeds; the watch channel keeps a
    /// reconnect from replaying already-delivered snapshots.
    async fn snapshot_with_retry(&self, room: &RoomKey) -> Snapshot {
        let mut delay = RETRY_BASE;
        loop {
            match self.store.list(room).await {
                Ok(snapshot) => return snapshot,
                Err(err) => {
                    tracing::warn!(room = %room, %err, "snapshot read failed, retrying");
                    let jitter = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
            }
        }
    }
}
