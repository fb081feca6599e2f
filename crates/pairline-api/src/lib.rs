pub mod auth;
pub mod channels;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod users;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

use crate::auth::AppState;

/// Every authenticated REST route, bound to `state`.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/users", get(users::list_users))
        .route("/users/me", put(users::update_me))
        .route("/channels", post(channels::open_channel))
        .route("/channels/{channel_id}/messages", get(messages::get_messages))
        .route("/channels/{channel_id}/messages", post(messages::send_message))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
