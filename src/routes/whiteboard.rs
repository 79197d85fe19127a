//! Persistence endpoints: `GET` and `POST /whiteboard/{id}`.
//!
//! The body is parsed by hand rather than through the `Json` extractor so
//! every malformed save, including non-JSON bodies, gets the same 400
//! `ErrorBody` instead of an extractor rejection.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::{
    ERR_FETCH_FAILED, ERR_INVALID_DATA, ERR_INVALID_ID, ERR_NOT_FOUND, ERR_SAVE_FAILED, ErrorBody, SaveReceipt,
};
use crate::frame::now_ms;
use crate::state::AppState;

/// `GET /whiteboard/{id}`: the stored blob, or 404.
pub async fn get_whiteboard(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    // No row can exist under an id that is not a UUID.
    let Ok(whiteboard_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::NOT_FOUND, ERR_NOT_FOUND);
    };

    match state.store.load(whiteboard_id).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, ERR_NOT_FOUND),
        Err(e) => {
            error!(%whiteboard_id, error = %e, "whiteboard: fetch failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, ERR_FETCH_FAILED)
        }
    }
}

/// `POST /whiteboard/{id}`: upsert the blob.
pub async fn save_whiteboard(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
    let Ok(whiteboard_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, ERR_INVALID_ID);
    };
    let Some(encrypted_data) = parse_save_body(&body) else {
        return error_response(StatusCode::BAD_REQUEST, ERR_INVALID_DATA);
    };

    match state.store.save(whiteboard_id, &encrypted_data, now_ms()).await {
        Ok(updated_at) => {
            info!(%whiteboard_id, bytes = encrypted_data.len(), updated_at, "whiteboard: saved");
            Json(SaveReceipt { success: true, updated_at }).into_response()
        }
        Err(e) => {
            error!(%whiteboard_id, error = %e, "whiteboard: save failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, ERR_SAVE_FAILED)
        }
    }
}

/// Extract a non-empty `encryptedData` string from a save body.
#[must_use]
pub fn parse_save_body(body: &[u8]) -> Option<String> {
    let Ok(Value::Object(mut fields)) = serde_json::from_slice::<Value>(body) else {
        return None;
    };
    match fields.remove("encryptedData") {
        Some(Value::String(data)) if !data.is_empty() => Some(data),
        _ => None,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

#[cfg(test)]
#[path = "whiteboard_test.rs"]
mod tests;
