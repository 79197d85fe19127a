use std::sync::Arc;

use tracing::{info, warn};
use whiteboard::config::ServerConfig;
use whiteboard::routes;
use whiteboard::services::store::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore, StoreError};
use whiteboard::state::AppState;

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("snapshot store init failed: {0}")]
    Store(#[from] StoreError),
    #[error("server io: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    if let Err(e) = dotenvy::dotenv() {
        // A missing .env is the common case.
        if !e.not_found() {
            eprintln!("ignoring malformed .env: {e}");
        }
    }
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();

    let store: Arc<dyn SnapshotStore> = match &config.database_url {
        Some(url) => {
            Arc::new(PgSnapshotStore::connect(url, config.db_max_connections, config.db_acquire_timeout).await?)
        }
        None => {
            warn!("DATABASE_URL not set; snapshots are kept in memory only");
            Arc::new(MemorySnapshotStore::new())
        }
    };

    let app = routes::app(AppState::new(store));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!(port = config.port, "whiteboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}
