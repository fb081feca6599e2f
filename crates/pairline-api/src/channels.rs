use axum::{Extension, Json, extract::State};
use tracing::debug;

use pairline_types::api::{Claims, OpenChannelRequest, OpenChannelResponse};

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn open_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenChannelRequest>,
) -> Result<Json<OpenChannelResponse>, ApiError> {
    let channel_id = state.service.open_channel(&claims.sub, &req.other_user_id)?;
    debug!("{} resolved {} with {}", claims.sub, channel_id, req.other_user_id);
    Ok(Json(OpenChannelResponse { channel_id }))
}
