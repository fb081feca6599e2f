pub mod api;
pub mod channel;
pub mod error;
pub mod events;
pub mod models;

pub use channel::{ChannelId, resolve_channel, validate_user_id};
pub use error::{ChatError, Result};
