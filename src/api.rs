//! Persistence HTTP contract shared by the server routes and the client.
//!
//! `GET /whiteboard/{id}` → `StoredSnapshot` | 404 `ErrorBody`
//! `POST /whiteboard/{id}` with `SaveRequest` → `SaveReceipt` | 400/500 `ErrorBody`
//!
//! Timestamps are integer milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};

pub const ERR_NOT_FOUND: &str = "Whiteboard not found";
pub const ERR_INVALID_DATA: &str = "Invalid encrypted data";
pub const ERR_INVALID_ID: &str = "Invalid whiteboard id";
pub const ERR_FETCH_FAILED: &str = "Failed to fetch whiteboard";
pub const ERR_SAVE_FAILED: &str = "Failed to save whiteboard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub encrypted_data: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub encrypted_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    pub success: bool,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
