use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::ChatError;

// -- Identity --

/// Claims carried by the bearer token the identity provider hands to clients.
/// Shared by the REST middleware and the gateway Identify handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

// -- Directory --

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub display_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub user_id: String,
    pub display_label: Option<String>,
    pub online: bool,
}

// -- Channels --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenChannelRequest {
    pub other_user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub channel_id: ChannelId,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
}

// -- Errors --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&ChatError> for ErrorResponse {
    fn from(err: &ChatError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
