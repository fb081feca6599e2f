use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::ChatError;
use crate::models::Message;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful identification
    Ready { user_id: String },

    /// Channel resolved and subscribed; `backfill` holds everything after the client cursor
    ChannelOpened {
        channel_id: ChannelId,
        backfill: Vec<Message>,
    },

    /// A message was committed to the channel the client is viewing
    MessageCreate { message: Message },

    /// The client's own SendMessage was committed
    MessageAck { sequence: u64 },

    /// Push delivery was dropped; send Resume to backfill
    SubscriptionLost {
        channel_id: ChannelId,
        last_sequence: u64,
    },

    /// A user came online or went offline
    PresenceUpdate {
        user_id: String,
        display_label: Option<String>,
        online: bool,
    },

    /// A command failed
    Error { code: String, message: String },
}

impl From<&ChatError> for GatewayEvent {
    fn from(err: &ChatError) -> Self {
        match err {
            ChatError::SubscriptionLost {
                channel_id,
                last_sequence,
            } => match channel_id.parse() {
                Ok(channel_id) => Self::SubscriptionLost {
                    channel_id,
                    last_sequence: *last_sequence,
                },
                Err(_) => Self::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                },
            },
            _ => Self::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Bind this connection to the channel shared with `other_user_id`
    OpenChannel { other_user_id: String },

    /// Append text to the open channel
    SendMessage { text: String },

    /// Re-subscribe after SubscriptionLost, backfilling after the given cursor
    /// (or after the last sequence the server delivered when omitted)
    Resume {
        #[serde(default)]
        after_sequence: Option<u64>,
    },

    /// Leave the open channel
    CloseChannel,
}
