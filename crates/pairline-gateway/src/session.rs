//! Per-connection channel session.
//!
//! ```text
//! Uninitialized --open--> Resolving --ok--> Active --close--> Closed
//!                             |                 \--open(other pair)--> Resolving
//!                             \--invalid pair--> Closed
//! ```
//!
//! The session owns no copy of the log. It keeps the channel id, the cursor
//! of the last delivered sequence and its live subscription.

use tracing::{debug, info, warn};
use uuid::Uuid;

use pairline_db::MessageStore;
use pairline_types::models::Message;
use pairline_types::{ChannelId, ChatError, Result, resolve_channel};

use crate::dispatcher::{SessionHandle, Subscription, SubscriptionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Resolving,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Same channel as before; the existing subscription was kept
    Unchanged { channel_id: ChannelId },
    /// Newly bound; `backfill` is the log up to the subscription cursor
    Opened {
        channel_id: ChannelId,
        backfill: Vec<Message>,
    },
}

pub struct ChannelSession {
    handle: SessionHandle,
    store: MessageStore,
    subscriptions: SubscriptionManager,
    state: SessionState,
    current_user: Option<String>,
    channel_id: Option<ChannelId>,
    cursor: u64,
    subscription: Option<Subscription>,
    draft: String,
}

impl ChannelSession {
    pub fn new(store: MessageStore, subscriptions: SubscriptionManager) -> Self {
        Self {
            handle: Uuid::new_v4(),
            store,
            subscriptions,
            state: SessionState::Uninitialized,
            current_user: None,
            channel_id: None,
            cursor: 0,
            subscription: None,
            draft: String::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.channel_id.as_ref()
    }

    /// Last sequence delivered to the client, via backfill or push.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Whether pushes are flowing. False after [`ChatError::SubscriptionLost`] until `resume`.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Bind the session to the channel shared by `current_user` and `other_user`.
    pub fn open(&mut self, current_user: &str, other_user: &str) -> Result<OpenOutcome> {
        if self.state == SessionState::Closed {
            return Err(ChatError::SessionClosed);
        }

        let previous = self.state;
        self.state = SessionState::Resolving;

        let channel_id = match resolve_channel(current_user, other_user) {
            Ok(channel_id) => channel_id,
            Err(e) => {
                warn!("Session {} failed to resolve channel: {}", self.handle, e);
                self.close();
                return Err(e);
            }
        };

        if previous == SessionState::Active && self.channel_id.as_ref() == Some(&channel_id) {
            self.current_user = Some(current_user.to_string());
            self.state = SessionState::Active;
            if self.subscription.is_some() {
                debug!("Session {} already on {}", self.handle, channel_id);
                return Ok(OpenOutcome::Unchanged { channel_id });
            }
            // Same channel but the push stream was dropped; pick up after the cursor
            let backfill = self.attach(self.cursor)?;
            info!(
                "Session {} reattached to {} ({} backfilled)",
                self.handle,
                channel_id,
                backfill.len()
            );
            return Ok(OpenOutcome::Opened {
                channel_id,
                backfill,
            });
        }

        self.detach();
        self.channel_id = Some(channel_id.clone());
        self.current_user = Some(current_user.to_string());
        self.cursor = 0;

        match self.attach(0) {
            Ok(backfill) => {
                self.state = SessionState::Active;
                info!(
                    "Session {} active on {} ({} backfilled)",
                    self.handle,
                    channel_id,
                    backfill.len()
                );
                Ok(OpenOutcome::Opened {
                    channel_id,
                    backfill,
                })
            }
            Err(e) => {
                // Transient; the caller may open again
                warn!("Session {} could not attach to {}: {}", self.handle, channel_id, e);
                self.channel_id = None;
                self.current_user = None;
                self.state = SessionState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Append `text` as the current user. The committed message also comes back
    /// through this session's own subscription; [`ChannelSession::next_message`]
    /// delivers it once.
    pub fn send_text(&mut self, text: &str) -> Result<Message> {
        let (channel_id, sender) = self.active_binding()?;
        self.subscriptions.append(&channel_id, &sender, text)
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn update_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Send the draft. It is cleared only when the append succeeds.
    pub fn submit_draft(&mut self) -> Result<Message> {
        let text = self.draft.clone();
        let message = self.send_text(&text)?;
        self.draft.clear();
        Ok(message)
    }

    /// Wait for the next pushed message after the cursor.
    ///
    /// Cancel safe. Returns [`ChatError::SubscriptionLost`] once if the manager
    /// dropped this session; call [`ChannelSession::resume`] to continue.
    pub async fn next_message(&mut self) -> Result<Message> {
        loop {
            let received = self.live_subscription()?.recv().await;
            match received {
                Some(message) => {
                    if let Some(message) = self.accept(message) {
                        return Ok(message);
                    }
                }
                None => return Err(self.lost()),
            }
        }
    }

    /// Non-blocking variant of [`ChannelSession::next_message`].
    pub fn try_next_message(&mut self) -> Result<Option<Message>> {
        loop {
            let polled = self.live_subscription()?.try_recv();
            match polled {
                Ok(Some(message)) => {
                    if let Some(message) = self.accept(message) {
                        return Ok(Some(message));
                    }
                }
                Ok(None) => return Ok(None),
                Err(()) => return Err(self.lost()),
            }
        }
    }

    /// Re-subscribe and backfill after `after_sequence`, or after the session
    /// cursor when `None`. Nothing already delivered is repeated.
    pub fn resume(&mut self, after_sequence: Option<u64>) -> Result<Vec<Message>> {
        let (channel_id, _) = self.active_binding()?;
        let after = after_sequence.unwrap_or(self.cursor);

        self.detach();
        let backfill = self.attach(after)?;
        info!(
            "Session {} resumed {} after #{} ({} backfilled)",
            self.handle,
            channel_id,
            after,
            backfill.len()
        );
        Ok(backfill)
    }

    /// Terminal. Safe to call repeatedly and at any time.
    pub fn close(&mut self) {
        self.detach();
        if self.state != SessionState::Closed {
            debug!("Session {} closed", self.handle);
        }
        self.channel_id = None;
        self.state = SessionState::Closed;
    }

    /// Subscribe first, then read the log up to the subscription cursor.
    fn attach(&mut self, after: u64) -> Result<Vec<Message>> {
        let channel_id = self.channel_id.clone().ok_or(ChatError::SessionClosed)?;
        let subscription = self.subscriptions.subscribe(&channel_id, self.handle)?;
        let tail = subscription.cursor();

        // A cursor ahead of the log cannot be honoured; fall back to the tail
        let from = after.min(tail);
        let backfill = match self
            .store
            .read_between(&channel_id, from, tail)
            .collect::<Result<Vec<_>>>()
        {
            Ok(backfill) => backfill,
            Err(e) => {
                self.subscriptions.unsubscribe(&channel_id, self.handle);
                return Err(e);
            }
        };

        self.cursor = tail;
        self.subscription = Some(subscription);
        Ok(backfill)
    }

    fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.subscriptions
                .unsubscribe(subscription.channel_id(), self.handle);
        }
    }

    fn accept(&mut self, message: Message) -> Option<Message> {
        if message.sequence <= self.cursor {
            // Echo of something already delivered
            return None;
        }
        self.cursor = message.sequence;
        Some(message)
    }

    fn lost(&mut self) -> ChatError {
        self.subscription = None;
        let channel_id = self
            .channel_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        warn!(
            "Session {} lost its subscription to {} at #{}",
            self.handle, channel_id, self.cursor
        );
        ChatError::SubscriptionLost {
            channel_id,
            last_sequence: self.cursor,
        }
    }

    fn live_subscription(&mut self) -> Result<&mut Subscription> {
        if self.state != SessionState::Active {
            return Err(ChatError::SessionClosed);
        }
        let cursor = self.cursor;
        let channel_id = self.channel_id.as_ref().map(ToString::to_string);
        self.subscription
            .as_mut()
            .ok_or_else(|| ChatError::SubscriptionLost {
                channel_id: channel_id.unwrap_or_default(),
                last_sequence: cursor,
            })
    }

    fn active_binding(&self) -> Result<(ChannelId, String)> {
        match (self.state, &self.channel_id, &self.current_user) {
            (SessionState::Active, Some(channel_id), Some(user)) => {
                Ok((channel_id.clone(), user.clone()))
            }
            (SessionState::Closed, _, _) => Err(ChatError::SessionClosed),
            _ => Err(ChatError::InvalidParticipants(
                "session has no open channel".into(),
            )),
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.detach();
    }
}
