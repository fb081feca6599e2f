use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use pairline_types::ChannelId;
use pairline_types::api::{Claims, SendMessageRequest};
use pairline_types::models::Message;

use crate::auth::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Sequence cursor; the page starts right after it
    #[serde(default)]
    pub after: u64,
    pub limit: Option<u32>,
}

/// The sender is always the caller. Push subscribers see the message before
/// this handler returns.
pub async fn send_message(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel_id: ChannelId = channel_id.parse()?;

    // Run blocking DB insert off the async runtime
    let service = state.service.clone();
    let message = tokio::task::spawn_blocking(move || {
        service.send_message(&channel_id, &claims.sub, &req.text)
    })
    .await??;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Ordered page of the channel log after `after`. Participants only.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let channel_id: ChannelId = channel_id.parse()?;
    let limit = query
        .limit
        .unwrap_or(state.history_limit)
        .min(state.history_limit);

    let service = state.service.clone();
    let messages = tokio::task::spawn_blocking(move || {
        service.history(&channel_id, &claims.sub, query.after, limit)
    })
    .await??;

    Ok(Json(messages))
}
