use std::sync::Arc;

use pairline_gateway::ChatService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub service: ChatService,
    pub jwt_secret: String,
    /// Upper bound on `limit` for history pages
    pub history_limit: u32,
}

impl AppStateInner {
    pub fn new(service: ChatService, jwt_secret: impl Into<String>, history_limit: u32) -> AppState {
        Arc::new(Self {
            service,
            jwt_secret: jwt_secret.into(),
            history_limit,
        })
    }
}
