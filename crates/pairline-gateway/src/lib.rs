pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod identity;
pub mod service;
pub mod session;

pub use directory::Directory;
pub use dispatcher::{Subscription, SubscriptionManager};
pub use identity::verify_token;
pub use service::{ChatService, ServiceConfig, SubscriptionHandle};
pub use session::{ChannelSession, OpenOutcome, SessionState};
