use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use pairline_db::MessageStore;
use pairline_types::models::Message;
use pairline_types::{ChannelId, Result};

/// Default per-subscriber queue depth. A subscriber that falls this far
/// behind is dropped and must resume from its cursor.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Handle identifying one live session to the manager.
pub type SessionHandle = Uuid;

type Subscribers = HashMap<SessionHandle, mpsc::Sender<Message>>;

/// Tracks live subscribers per channel and fans committed messages out to them.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: MessageStore,
    channels: RwLock<HashMap<ChannelId, Subscribers>>,
    queue_depth: usize,
}

/// A registration returned by [`SubscriptionManager::subscribe`].
///
/// Messages arrive in commit order. When the manager drops this subscriber
/// (queue overflow) the stream ends and [`Subscription::recv`] returns `None`.
pub struct Subscription {
    channel_id: ChannelId,
    cursor: u64,
    receiver: mpsc::Receiver<Message>,
}

impl Subscription {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Channel tail at registration. Every later commit is pushed; everything
    /// up to here must be read from the store.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Non-blocking poll. `Ok(None)` means nothing queued; `Err(())` means the
    /// subscription was dropped by the manager.
    pub fn try_recv(&mut self) -> std::result::Result<Option<Message>, ()> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(()),
        }
    }
}

impl SubscriptionManager {
    pub fn new(store: MessageStore) -> Self {
        Self::with_queue_depth(store, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(store: MessageStore, queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                channels: RwLock::new(HashMap::new()),
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    /// Register `handle` for pushes on `channel_id`.
    ///
    /// Registration happens under the channel's append lock, so the returned
    /// cursor splits the log exactly: `<= cursor` via backfill, `> cursor` via push.
    /// Subscribing an already registered handle replaces its queue.
    pub fn subscribe(&self, channel_id: &ChannelId, handle: SessionHandle) -> Result<Subscription> {
        let (tx, receiver) = mpsc::channel(self.inner.queue_depth);

        let cursor = self.inner.store.with_tail(channel_id, |tail| {
            self.write()
                .entry(channel_id.clone())
                .or_default()
                .insert(handle, tx);
            tail
        })?;

        debug!("{} subscribed to {} at #{}", handle, channel_id, cursor);
        Ok(Subscription {
            channel_id: channel_id.clone(),
            cursor,
            receiver,
        })
    }

    /// Idempotent. Returns whether a registration was removed.
    pub fn unsubscribe(&self, channel_id: &ChannelId, handle: SessionHandle) -> bool {
        let (removed, emptied) = {
            let mut channels = self.write();
            match channels.get_mut(channel_id) {
                Some(subscribers) => {
                    let removed = subscribers.remove(&handle).is_some();
                    let emptied = subscribers.is_empty();
                    if emptied {
                        channels.remove(channel_id);
                    }
                    (removed, emptied)
                }
                None => (false, false),
            }
        };

        if removed {
            debug!("{} unsubscribed from {}", handle, channel_id);
        }
        if emptied {
            self.inner.store.evict_idle(channel_id);
        }
        removed
    }

    /// Deliver a committed message to every current subscriber of its channel.
    ///
    /// Must be called in commit order; [`SubscriptionManager::append`] does
    /// so by publishing under the store's append lock. A full or closed queue
    /// drops that subscriber only.
    pub fn publish(&self, message: &Message) {
        let mut dropped: Vec<(SessionHandle, mpsc::Sender<Message>)> = Vec::new();

        {
            let channels = self.read();
            let Some(subscribers) = channels.get(&message.channel_id) else {
                return;
            };

            for (handle, tx) in subscribers {
                match tx.try_send(message.clone()) {
                    Ok(()) => {
                        trace!("{}#{} -> {}", message.channel_id, message.sequence, handle);
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Subscriber {} on {} fell behind at #{}, dropping",
                            handle, message.channel_id, message.sequence
                        );
                        dropped.push((*handle, tx.clone()));
                    }
                    Err(TrySendError::Closed(_)) => {
                        dropped.push((*handle, tx.clone()));
                    }
                }
            }
        }

        if dropped.is_empty() {
            return;
        }

        let mut channels = self.write();
        if let Some(subscribers) = channels.get_mut(&message.channel_id) {
            for (handle, tx) in &dropped {
                // Only remove if the handle has not re-subscribed in the meantime
                if subscribers.get(handle).is_some_and(|current| current.same_channel(tx)) {
                    subscribers.remove(handle);
                }
            }
            if subscribers.is_empty() {
                channels.remove(&message.channel_id);
            }
        }
    }

    /// Append to the store and publish in the same critical section. A channel
    /// nobody watches does not keep its tail cached afterwards.
    pub fn append(&self, channel_id: &ChannelId, sender_id: &str, text: &str) -> Result<Message> {
        let message = self
            .inner
            .store
            .append_then(channel_id, sender_id, text, |message| self.publish(message))?;
        if self.subscriber_count(channel_id) == 0 {
            self.inner.store.evict_idle(channel_id);
        }
        Ok(message)
    }

    pub fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        self.read().get(channel_id).map_or(0, |subscribers| subscribers.len())
    }

    // Map mutations never panic halfway, so a poisoned lock still guards a valid map.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ChannelId, Subscribers>> {
        self.inner.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ChannelId, Subscribers>> {
        self.inner.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairline_db::Database;
    use pairline_types::resolve_channel;

    fn manager(queue_depth: usize) -> SubscriptionManager {
        let store = MessageStore::new(Arc::new(Database::open_in_memory().unwrap()));
        SubscriptionManager::with_queue_depth(store, queue_depth)
    }

    fn drain(subscription: &mut Subscription) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(Some(message)) = subscription.try_recv() {
            seqs.push(message.sequence);
        }
        seqs
    }

    #[test]
    fn subscriber_receives_both_in_order() {
        let manager = manager(16);
        let channel = resolve_channel("u1", "u2").unwrap();
        let mut sub = manager.subscribe(&channel, Uuid::new_v4()).unwrap();
        assert_eq!(sub.cursor(), 0);

        manager.append(&channel, "u1", "first").unwrap();
        manager.append(&channel, "u2", "second").unwrap();

        assert_eq!(drain(&mut sub), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_between_appends_receives_only_first() {
        let manager = manager(16);
        let channel = resolve_channel("u1", "u2").unwrap();
        let handle = Uuid::new_v4();
        let mut sub = manager.subscribe(&channel, handle).unwrap();

        manager.append(&channel, "u1", "first").unwrap();
        assert!(manager.unsubscribe(&channel, handle));
        manager.append(&channel, "u1", "second").unwrap();

        assert_eq!(sub.try_recv().map(|m| m.map(|m| m.text)), Ok(Some("first".to_string())));
        // Sender side is gone; nothing further arrives
        assert_eq!(sub.try_recv(), Err(()));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let manager = manager(16);
        let channel = resolve_channel("u1", "u2").unwrap();
        let handle = Uuid::new_v4();
        assert!(!manager.unsubscribe(&channel, handle));

        let _sub = manager.subscribe(&channel, handle).unwrap();
        assert!(manager.unsubscribe(&channel, handle));
        assert!(!manager.unsubscribe(&channel, handle));
        assert_eq!(manager.subscriber_count(&channel), 0);
    }

    #[test]
    fn cursor_marks_the_tail() {
        let manager = manager(16);
        let channel = resolve_channel("u1", "u2").unwrap();
        manager.append(&channel, "u1", "before").unwrap();
        manager.append(&channel, "u1", "before again").unwrap();

        let mut sub = manager.subscribe(&channel, Uuid::new_v4()).unwrap();
        assert_eq!(sub.cursor(), 2);

        manager.append(&channel, "u2", "after").unwrap();
        assert_eq!(drain(&mut sub), vec![3]);
    }

    #[test]
    fn slow_subscriber_is_dropped_without_affecting_others() {
        let manager = manager(2);
        let channel = resolve_channel("u1", "u2").unwrap();
        let mut slow = manager.subscribe(&channel, Uuid::new_v4()).unwrap();
        let mut fast = manager.subscribe(&channel, Uuid::new_v4()).unwrap();

        let mut fast_seen = Vec::new();
        for i in 0..5 {
            manager.append(&channel, "u1", &format!("m{}", i)).unwrap();
            fast_seen.extend(drain(&mut fast));
        }

        assert_eq!(fast_seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(manager.subscriber_count(&channel), 1);

        // The slow one keeps what was queued, then sees the end of the stream
        assert_eq!(slow.try_recv().unwrap().map(|m| m.sequence), Some(1));
        assert_eq!(slow.try_recv().unwrap().map(|m| m.sequence), Some(2));
        assert_eq!(slow.try_recv(), Err(()));
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_publish() {
        let manager = manager(4);
        let channel = resolve_channel("u1", "u2").unwrap();
        let sub = manager.subscribe(&channel, Uuid::new_v4()).unwrap();
        assert_eq!(manager.subscriber_count(&channel), 1);

        drop(sub);
        manager.append(&channel, "u1", "anyone there").unwrap();
        assert_eq!(manager.subscriber_count(&channel), 0);
    }

    #[test]
    fn resubscribe_replaces_queue_and_keeps_count() {
        let manager = manager(4);
        let channel = resolve_channel("u1", "u2").unwrap();
        let handle = Uuid::new_v4();
        let _first = manager.subscribe(&channel, handle).unwrap();
        let mut second = manager.subscribe(&channel, handle).unwrap();
        assert_eq!(manager.subscriber_count(&channel), 1);

        manager.append(&channel, "u2", "hello").unwrap();
        assert_eq!(drain(&mut second), vec![1]);
    }

    #[test]
    fn publish_only_reaches_its_channel() {
        let manager = manager(4);
        let a = resolve_channel("u1", "u2").unwrap();
        let b = resolve_channel("u1", "u3").unwrap();
        let mut sub_a = manager.subscribe(&a, Uuid::new_v4()).unwrap();
        let mut sub_b = manager.subscribe(&b, Uuid::new_v4()).unwrap();

        manager.append(&b, "u3", "for b").unwrap();
        assert!(drain(&mut sub_a).is_empty());
        assert_eq!(drain(&mut sub_b), vec![1]);
    }

    #[tokio::test]
    async fn concurrent_writers_preserve_commit_order_per_subscriber() {
        let manager = manager(1024);
        let channel = resolve_channel("u1", "u2").unwrap();
        let mut sub = manager.subscribe(&channel, Uuid::new_v4()).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let manager = manager.clone();
                let channel = channel.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..50 {
                        let sender = if t % 2 == 0 { "u1" } else { "u2" };
                        manager.append(&channel, sender, &format!("{}:{}", t, i)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut expected = 1;
        while let Ok(Some(message)) = sub.try_recv() {
            assert_eq!(message.sequence, expected);
            expected += 1;
        }
        assert_eq!(expected, 201);
    }

    #[test]
    fn idle_channels_leave_the_tail_cache() {
        let manager = manager(16);
        let store = manager.inner.store.clone();
        let watched = resolve_channel("u1", "u2").unwrap();
        let unwatched = resolve_channel("u1", "u3").unwrap();
        let handle = Uuid::new_v4();

        let mut sub = manager.subscribe(&watched, handle).unwrap();
        manager.append(&watched, "u1", "kept").unwrap();
        manager.append(&unwatched, "u1", "gone").unwrap();
        assert_eq!(store.cached_channels(), 1);

        assert!(manager.unsubscribe(&watched, handle));
        assert_eq!(store.cached_channels(), 0);
        assert_eq!(drain(&mut sub), vec![1]);

        // Sequences pick up from disk
        assert_eq!(manager.append(&watched, "u2", "again").unwrap().sequence, 2);
        assert_eq!(manager.append(&unwatched, "u3", "again").unwrap().sequence, 2);
        assert_eq!(store.cached_channels(), 0);
    }
}
