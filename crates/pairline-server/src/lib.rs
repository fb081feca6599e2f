pub mod config;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use pairline_api::auth::AppState;
use pairline_gateway::connection;

/// Assemble the full HTTP surface: health, REST and the gateway upgrade.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    Router::new()
        .merge(public_routes)
        .merge(pairline_api::routes(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let service = state.service.clone();
    let jwt_secret = state.jwt_secret.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, service, jwt_secret))
}
