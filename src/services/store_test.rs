use super::*;
use crate::frame::ErrorCode;

#[tokio::test]
async fn missing_whiteboard_loads_none() {
    let store = MemorySnapshotStore::new();
    assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn save_then_load_returns_blob() {
    let store = MemorySnapshotStore::new();
    let id = Uuid::new_v4();
    assert_eq!(store.save(id, "blob-1", 1_000).await.unwrap(), 1_000);

    let stored = store.load(id).await.unwrap().unwrap();
    assert_eq!(stored.encrypted_data, "blob-1");
    assert_eq!(stored.updated_at, 1_000);
}

#[tokio::test]
async fn overwrite_keeps_created_at() {
    let store = MemorySnapshotStore::new();
    let id = Uuid::new_v4();
    store.save(id, "blob-1", 1_000).await.unwrap();
    store.save(id, "blob-2", 2_000).await.unwrap();

    let stored = store.load(id).await.unwrap().unwrap();
    assert_eq!(stored.encrypted_data, "blob-2");
    assert_eq!(stored.updated_at, 2_000);
    assert_eq!(store.created_at(id).await, Some(1_000));
}

#[tokio::test]
async fn whiteboards_are_isolated() {
    let store = MemorySnapshotStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    store.save(a, "a", 1).await.unwrap();
    assert!(store.load(b).await.unwrap().is_none());
}

#[test]
fn store_error_is_retryable() {
    let err = StoreError::Database(sqlx::Error::PoolTimedOut);
    assert_eq!(err.error_code(), "E_STORE_DATABASE");
    assert!(err.retryable());
}

#[tokio::test]
async fn connect_to_unreachable_postgres_fails_as_database_error() {
    let result = PgSnapshotStore::connect("postgres://wb:wb@127.0.0.1:1/whiteboard", 1, Duration::from_millis(500)).await;
    assert!(matches!(result, Err(StoreError::Database(_))));
}
