use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio::task::JoinError;
use tracing::error;

use pairline_types::ChatError;
use pairline_types::api::ErrorResponse;

/// Handler error: a domain failure or a broken blocking task.
#[derive(Debug)]
pub enum ApiError {
    Chat(ChatError),
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Chat(err) => match err {
                ChatError::InvalidParticipants(_) | ChatError::EmptyMessage => {
                    StatusCode::BAD_REQUEST
                }
                ChatError::UnauthorizedSender { .. } => StatusCode::FORBIDDEN,
                ChatError::ChannelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                ChatError::SubscriptionLost { .. } => StatusCode::CONFLICT,
                ChatError::SessionClosed => StatusCode::GONE,
            },
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self::Chat(err)
    }
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        error!("spawn_blocking join error: {}", err);
        Self::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Chat(err) => ErrorResponse::from(err),
            Self::Internal => ErrorResponse {
                code: "internal".into(),
                message: "internal server error".into(),
            },
        };
        (status, Json(body)).into_response()
    }
}
