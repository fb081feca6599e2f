//! Error taxonomy shared by the store, the gateway and the REST layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Identity resolution input was unusable (empty, identical or malformed ids)
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    /// Message text was blank after trimming
    #[error("message text is empty")]
    EmptyMessage,

    /// Sender is not one of the two users encoded in the channel id
    #[error("{sender_id} is not a participant of channel {channel_id}")]
    UnauthorizedSender {
        channel_id: String,
        sender_id: String,
    },

    /// Transient store or transport failure; safe to retry
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Push delivery was dropped; reconnect and backfill after `last_sequence`
    #[error("subscription to {channel_id} lost after sequence {last_sequence}")]
    SubscriptionLost {
        channel_id: String,
        last_sequence: u64,
    },

    /// The session has been closed and accepts no further operations
    #[error("session is closed")]
    SessionClosed,
}

impl ChatError {
    /// Wrap any infrastructure failure as a transient channel error.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::ChannelUnavailable(err.to_string())
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParticipants(_) => "invalid_participants",
            Self::EmptyMessage => "empty_message",
            Self::UnauthorizedSender { .. } => "unauthorized_sender",
            Self::ChannelUnavailable(_) => "channel_unavailable",
            Self::SubscriptionLost { .. } => "subscription_lost",
            Self::SessionClosed => "session_closed",
        }
    }

    /// Transient errors may be retried by the client; validation errors may not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable(_) | Self::SubscriptionLost { .. }
        )
    }
}
