//! Channel identity: one canonical id per unordered pair of users.
//!
//! The id is `min(a, b) + "_" + max(a, b)`. It is never allocated or stored
//! on its own; every component recomputes or parses it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ChatError, Result};

const SEPARATOR: char = '_';

/// Canonical two-party channel identifier. Only constructible from a valid pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

/// Resolve the channel shared by two users. Order of arguments does not matter.
pub fn resolve_channel(user_a: &str, user_b: &str) -> Result<ChannelId> {
    validate_user_id(user_a)?;
    validate_user_id(user_b)?;

    if user_a == user_b {
        return Err(ChatError::InvalidParticipants(format!(
            "{} cannot open a channel with themself",
            user_a
        )));
    }

    let (low, high) = if user_a < user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };

    Ok(ChannelId(format!("{}{}{}", low, SEPARATOR, high)))
}

/// A user id usable as one half of a channel id.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(ChatError::InvalidParticipants("user id is empty".into()));
    }
    // The separator would make the joined id ambiguous
    if user_id.contains(SEPARATOR) {
        return Err(ChatError::InvalidParticipants(format!(
            "user id '{}' contains '{}'",
            user_id, SEPARATOR
        )));
    }
    Ok(())
}

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participants, in canonical (sorted) order.
    pub fn participants(&self) -> (&str, &str) {
        // Construction guarantees exactly one separator
        self.0
            .split_once(SEPARATOR)
            .unwrap_or((self.0.as_str(), ""))
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        let (a, b) = self.participants();
        a == user_id || b == user_id
    }

    /// The participant that is not `user_id`, or `None` if `user_id` is not in the channel.
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        match self.participants() {
            (a, b) if a == user_id => Some(b),
            (a, b) if b == user_id => Some(a),
            _ => None,
        }
    }
}

impl FromStr for ChannelId {
    type Err = ChatError;

    /// Parse a channel id received from the outside. Only canonical ids are accepted.
    fn from_str(s: &str) -> Result<Self> {
        let (a, b) = s.split_once(SEPARATOR).ok_or_else(|| {
            ChatError::InvalidParticipants(format!("malformed channel id '{}'", s))
        })?;

        let resolved = resolve_channel(a, b)?;
        if resolved.0 != s {
            return Err(ChatError::InvalidParticipants(format!(
                "channel id '{}' is not canonical",
                s
            )));
        }
        Ok(resolved)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
