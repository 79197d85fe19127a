//! The persistence contract against a real in-process server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;
use whiteboard::client::persistence::{PersistenceClient, PersistenceError, SnapshotApi};
use whiteboard::routes;
use whiteboard::services::store::MemorySnapshotStore;
use whiteboard::state::AppState;

async fn spawn_server() -> String {
    let state = AppState::new(Arc::new(MemorySnapshotStore::new()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes::app(state)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn healthz_is_ok() {
    let base = spawn_server().await;
    let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn unknown_whiteboard_is_404_with_error_body() {
    let base = spawn_server().await;
    let response = reqwest::get(format!("{base}/whiteboard/{}", Uuid::new_v4())).await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Whiteboard not found"}));
}

#[tokio::test]
async fn post_then_get_uses_camel_case_fields() {
    let base = spawn_server().await;
    let http = reqwest::Client::new();
    let url = format!("{base}/whiteboard/{}", Uuid::new_v4());

    let response = http.post(&url).json(&json!({"encryptedData": "AAAA"})).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let receipt: Value = response.json().await.unwrap();
    assert_eq!(receipt["success"], json!(true));
    let updated_at = receipt["updatedAt"].as_i64().unwrap();

    let stored: Value = http.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(stored, json!({"encryptedData": "AAAA", "updatedAt": updated_at}));
}

#[tokio::test]
async fn malformed_saves_are_400() {
    let base = spawn_server().await;
    let http = reqwest::Client::new();
    let url = format!("{base}/whiteboard/{}", Uuid::new_v4());

    for body in ["not json", "{}", r#"{"encryptedData":""}"#, r#"{"encryptedData":7}"#] {
        let response = http
            .post(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "body {body}");
        let error: Value = response.json().await.unwrap();
        assert_eq!(error, json!({"error": "Invalid encrypted data"}));
    }
}

#[tokio::test]
async fn persistence_client_round_trip() {
    let base = spawn_server().await;
    let client = PersistenceClient::new(base, Duration::from_secs(5)).unwrap();
    let id = Uuid::new_v4();

    assert!(client.fetch(id).await.unwrap().is_none());
    let receipt = client.store(id, "blob".into()).await.unwrap();
    assert!(receipt.success);

    let stored = client.fetch(id).await.unwrap().unwrap();
    assert_eq!(stored.encrypted_data, "blob");
    assert_eq!(stored.updated_at, receipt.updated_at);
}

#[tokio::test]
async fn persistence_client_surfaces_unreachable_server() {
    // Bind and drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = PersistenceClient::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
    let err = client.fetch(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, PersistenceError::Request(_) | PersistenceError::Timeout));
}
