use axum::{Extension, Json, extract::State};

use pairline_types::api::{Claims, DirectoryEntry, UpdateProfileRequest};
use pairline_types::models::User;

use crate::auth::AppState;
use crate::error::ApiError;

/// Upsert the caller. Without an explicit label the token's email is used.
pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<User>, ApiError> {
    let user = User {
        id: claims.sub,
        display_label: req.display_label.or(claims.email),
    };

    let service = state.service.clone();
    let stored = tokio::task::spawn_blocking(move || {
        service.directory().register(&user)?;
        Ok::<_, ApiError>(service.directory().get(&user.id)?.unwrap_or(user))
    })
    .await??;

    Ok(Json(stored))
}

/// Everyone the caller can open a channel with.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<DirectoryEntry>>, ApiError> {
    let service = state.service.clone();
    let contacts =
        tokio::task::spawn_blocking(move || service.directory().contacts(&claims.sub)).await??;
    Ok(Json(contacts))
}
