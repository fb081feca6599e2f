use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use pairline_db::{Database, MessageStore};
use pairline_types::models::Message;
use pairline_types::{ChannelId, ChatError, Result, resolve_channel};

use crate::directory::Directory;
use crate::dispatcher::{DEFAULT_QUEUE_DEPTH, SessionHandle, SubscriptionManager};
use crate::session::ChannelSession;

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    /// Per-subscriber push queue depth
    pub subscriber_queue: usize,
    /// Rows per backfill round trip
    pub backfill_page: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: DEFAULT_QUEUE_DEPTH,
            backfill_page: pairline_db::store::DEFAULT_PAGE_SIZE,
        }
    }
}

/// The client-facing operations, wired to one store, one subscription
/// manager and one directory.
#[derive(Clone)]
pub struct ChatService {
    store: MessageStore,
    subscriptions: SubscriptionManager,
    directory: Directory,
}

impl ChatService {
    pub fn new(db: Arc<Database>, config: ServiceConfig) -> Self {
        let store = MessageStore::with_page_size(db.clone(), config.backfill_page);
        let subscriptions = SubscriptionManager::with_queue_depth(store.clone(), config.subscriber_queue);
        Self {
            store,
            subscriptions,
            directory: Directory::new(db),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn open_channel(&self, user_a: &str, user_b: &str) -> Result<ChannelId> {
        resolve_channel(user_a, user_b)
    }

    /// Append and fan out in commit order.
    pub fn send_message(&self, channel_id: &ChannelId, sender_id: &str, text: &str) -> Result<Message> {
        self.subscriptions.append(channel_id, sender_id, text)
    }

    /// Bounded page of history after `after_sequence`, for a participant of the channel.
    pub fn history(
        &self,
        channel_id: &ChannelId,
        requester: &str,
        after_sequence: u64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        if !channel_id.is_participant(requester) {
            return Err(ChatError::UnauthorizedSender {
                channel_id: channel_id.to_string(),
                sender_id: requester.to_string(),
            });
        }
        self.store.read_page(channel_id, after_sequence, limit)
    }

    /// Push every future commit on `channel_id` to `on_message`.
    ///
    /// The callback runs on a forwarding task, never on the publisher. If the
    /// subscription is dropped for falling behind, the callback receives one
    /// [`ChatError::SubscriptionLost`] and the task ends. Must be called from
    /// within a tokio runtime.
    pub fn subscribe<F>(&self, channel_id: &ChannelId, mut on_message: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(Result<Message>) + Send + 'static,
    {
        let handle = Uuid::new_v4();
        let mut subscription = self.subscriptions.subscribe(channel_id, handle)?;
        let cursor = subscription.cursor();
        let channel = channel_id.clone();

        let task = tokio::spawn(async move {
            let mut last_sequence = cursor;
            while let Some(message) = subscription.recv().await {
                last_sequence = message.sequence;
                on_message(Ok(message));
            }
            on_message(Err(ChatError::SubscriptionLost {
                channel_id: channel.to_string(),
                last_sequence,
            }));
        });

        Ok(SubscriptionHandle {
            handle,
            channel_id: channel_id.clone(),
            cursor,
            subscriptions: self.subscriptions.clone(),
            task,
        })
    }

    /// A fresh session sharing this service's store and subscription manager.
    pub fn session(&self) -> ChannelSession {
        ChannelSession::new(self.store.clone(), self.subscriptions.clone())
    }
}

/// Live callback subscription. Cancelled on [`SubscriptionHandle::cancel`] or drop.
pub struct SubscriptionHandle {
    handle: SessionHandle,
    channel_id: ChannelId,
    cursor: u64,
    subscriptions: SubscriptionManager,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Tail at registration; backfill up to here with `read_between`.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Stop delivery now. Dropping the handle does the same.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        // Abort first so a cancelled callback never sees SubscriptionLost
        self.task.abort();
        self.subscriptions.unsubscribe(&self.channel_id, self.handle);
        debug!("Callback subscription {} on {} cancelled", self.handle, self.channel_id);
    }
}
