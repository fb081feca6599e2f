use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

/// A user as known to the directory. Ids come from the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_label: Option<String>,
}

/// One committed entry of a channel log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel_id: ChannelId,
    /// Per-channel, contiguous from 1
    pub sequence: u64,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    /// Assigned by the store at commit time
    pub server_timestamp: DateTime<Utc>,
}

impl Message {
    /// Display and replay order.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.server_timestamp, self.sequence)
    }
}
