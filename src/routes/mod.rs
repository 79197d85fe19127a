//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The server has two jobs: the persistence contract under `/whiteboard/{id}`
//! and the WebSocket relay under `/ws/{id}`. Both are keyed by the
//! whiteboard UUID and neither ever sees plaintext.

pub mod relay;
pub mod whiteboard;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/whiteboard/{id}",
            get(whiteboard::get_whiteboard).post(whiteboard::save_whiteboard),
        )
        .route("/ws/{id}", get(relay::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
