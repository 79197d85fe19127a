//! Persistence client: fetch and store the encrypted snapshot of one
//! whiteboard over the HTTP contract in [`crate::api`].
//!
//! The client never sees plaintext; callers hand it base64 ciphertext. Status
//! handling is split into pure `parse_*` functions so it is testable without
//! a server.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::api::{ErrorBody, SaveReceipt, SaveRequest, StoredSnapshot};

const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence request failed: {0}")]
    Request(String),
    #[error("persistence request timed out")]
    Timeout,
    #[error("persistence server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("persistence response parse failed: {0}")]
    Parse(String),
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl crate::frame::ErrorCode for PersistenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "E_PERSISTENCE_REQUEST",
            Self::Timeout => "E_PERSISTENCE_TIMEOUT",
            Self::Status { .. } => "E_PERSISTENCE_STATUS",
            Self::Parse(_) => "E_PERSISTENCE_PARSE",
            Self::HttpClientBuild(_) => "E_PERSISTENCE_CLIENT",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::HttpClientBuild(_))
    }
}

impl From<reqwest::Error> for PersistenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Remote snapshot storage as seen by a session.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// `Ok(None)` when the whiteboard has never been saved.
    async fn fetch(&self, whiteboard_id: Uuid) -> Result<Option<StoredSnapshot>, PersistenceError>;

    /// Overwrite the stored snapshot.
    async fn store(&self, whiteboard_id: Uuid, encrypted_data: String) -> Result<SaveReceipt, PersistenceError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct PersistenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl PersistenceClient {
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the TLS backend cannot be initialised.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PersistenceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
            .build()
            .map_err(|e| PersistenceError::HttpClientBuild(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self { http, base_url })
    }

    fn url(&self, whiteboard_id: Uuid) -> String {
        format!("{}/whiteboard/{whiteboard_id}", self.base_url)
    }
}

#[async_trait]
impl SnapshotApi for PersistenceClient {
    async fn fetch(&self, whiteboard_id: Uuid) -> Result<Option<StoredSnapshot>, PersistenceError> {
        let response = self.http.get(self.url(whiteboard_id)).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        parse_fetch_response(status, &text)
    }

    async fn store(&self, whiteboard_id: Uuid, encrypted_data: String) -> Result<SaveReceipt, PersistenceError> {
        let body = SaveRequest { encrypted_data };
        let response = self
            .http
            .post(self.url(whiteboard_id))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        parse_store_response(status, &text)
    }
}

// =============================================================================
// PARSING
// =============================================================================

fn error_message(text: &str) -> String {
    serde_json::from_str::<ErrorBody>(text).map_or_else(|_| text.to_owned(), |body| body.error)
}

/// # Errors
///
/// Any status other than 200/404, or a 200 body that is not a snapshot.
pub fn parse_fetch_response(status: u16, text: &str) -> Result<Option<StoredSnapshot>, PersistenceError> {
    match status {
        200 => serde_json::from_str(text)
            .map(Some)
            .map_err(|e| PersistenceError::Parse(e.to_string())),
        404 => Ok(None),
        _ => Err(PersistenceError::Status { status, message: error_message(text) }),
    }
}

/// # Errors
///
/// Any non-200 status, a malformed body, or `success: false`.
pub fn parse_store_response(status: u16, text: &str) -> Result<SaveReceipt, PersistenceError> {
    if status != 200 {
        return Err(PersistenceError::Status { status, message: error_message(text) });
    }
    let receipt: SaveReceipt = serde_json::from_str(text).map_err(|e| PersistenceError::Parse(e.to_string()))?;
    if !receipt.success {
        return Err(PersistenceError::Status { status, message: "save not acknowledged".into() });
    }
    Ok(receipt)
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
