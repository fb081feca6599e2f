use std::sync::Arc;

use tracing::info;

use pairline_api::auth::AppStateInner;
use pairline_db::Database;
use pairline_gateway::ChatService;
use pairline_server::build_router;
use pairline_server::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pairline=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    info!("Message log at {}", config.db_path.display());

    let service = ChatService::new(db, config.service_config());
    let state = AppStateInner::new(service, config.jwt_secret.clone(), config.history_limit);

    let app = build_router(state);

    let addr = config.addr()?;
    info!("Pairline server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
