use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use super::*;
use crate::api::{SaveReceipt, StoredSnapshot};
use crate::client::doc::{Fields, Mutation};
use crate::client::persistence::PersistenceError;
use crate::crypto::KdfParams;

fn fast_codec() -> Codec {
    Codec::new(KdfParams { memory_kib: 1024, iterations: 1, parallelism: 1 })
}

/// Records stores; optionally fails, optionally holds each store until the
/// test releases a permit.
#[derive(Default)]
struct MockApi {
    stores: Mutex<Vec<String>>,
    calls: AtomicUsize,
    fail: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl SnapshotApi for MockApi {
    async fn fetch(&self, _whiteboard_id: Uuid) -> Result<Option<StoredSnapshot>, PersistenceError> {
        Ok(None)
    }

    async fn store(&self, _whiteboard_id: Uuid, encrypted_data: String) -> Result<SaveReceipt, PersistenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistenceError::Status { status: 500, message: "boom".into() });
        }
        let mut stores = self.stores.lock().unwrap();
        stores.push(encrypted_data);
        Ok(SaveReceipt { success: true, updated_at: 1_000 + stores.len() as i64 })
    }
}

struct Harness {
    autosave: Autosave,
    api: Arc<MockApi>,
    doc: Arc<Mutex<Document>>,
    key: Arc<SessionKey>,
    notices: broadcast::Receiver<Notice>,
    open: Arc<AtomicBool>,
}

fn harness(api: MockApi, loaded: bool) -> Harness {
    let api = Arc::new(api);
    let doc = Arc::new(Mutex::new(Document::new(Uuid::new_v4())));
    let key = Arc::new(SessionKey::generate());
    let (notices_tx, notices) = broadcast::channel(16);
    let open = Arc::new(AtomicBool::new(true));
    let autosave = Autosave::new(
        AutosaveDeps {
            whiteboard_id: Uuid::new_v4(),
            doc: doc.clone(),
            api: api.clone(),
            codec: fast_codec(),
            key: key.clone(),
            notices: notices_tx,
            open: open.clone(),
        },
        loaded,
    );
    Harness { autosave, api, doc, key, notices, open }
}

fn edit(h: &Harness, id: &str) {
    let mut fields = Fields::new();
    fields.insert("x".into(), json!(1));
    h.doc.lock().unwrap().apply_local(Mutation::new().upsert(id, fields));
    h.autosave.mark_dirty();
}

// =============================================================================
// pure helpers
// =============================================================================

#[test]
fn since_last_save_is_derived() {
    assert_eq!(since_last_save(10_000, None), None);
    assert_eq!(since_last_save(10_000, Some(7_500)), Some(Duration::from_millis(2_500)));
    assert_eq!(since_last_save(1_000, Some(5_000)), Some(Duration::ZERO));
}

#[test]
fn policy_matrix() {
    assert!(policy_allows(ConnectionStatus::Connected, false));
    assert!(!policy_allows(ConnectionStatus::Disconnected, false));
    assert!(policy_allows(ConnectionStatus::Disconnected, true));
    assert!(policy_allows(ConnectionStatus::Connecting, true));
    assert!(!policy_allows(ConnectionStatus::Closed, true));
}

// =============================================================================
// status + dirty tracking
// =============================================================================

#[tokio::test]
async fn initial_status_depends_on_load() {
    assert_eq!(harness(MockApi::default(), true).autosave.status(), SaveStatus::Saved);
    assert_eq!(harness(MockApi::default(), false).autosave.status(), SaveStatus::Unsaved);
}

#[tokio::test]
async fn clean_tick_does_not_save() {
    let h = harness(MockApi::default(), true);
    assert_eq!(h.autosave.tick(ConnectionStatus::Connected, true).await, SaveOutcome::Clean);
    assert_eq!(h.api.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_save_per_dirty_period() {
    let h = harness(MockApi::default(), true);
    edit(&h, "e1");
    edit(&h, "e2");
    assert_eq!(h.autosave.status(), SaveStatus::Unsaved);

    assert!(matches!(h.autosave.tick(ConnectionStatus::Connected, true).await, SaveOutcome::Saved { .. }));
    assert_eq!(h.autosave.tick(ConnectionStatus::Connected, true).await, SaveOutcome::Clean);
    assert_eq!(h.api.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.autosave.status(), SaveStatus::Saved);
    assert_eq!(h.autosave.last_saved_at(), Some(1_001));
}

#[tokio::test]
async fn stored_blob_decrypts_to_element_array() {
    let h = harness(MockApi::default(), false);
    edit(&h, "e1");
    h.autosave.save_now().await;

    let blob = h.api.stores.lock().unwrap()[0].clone();
    let plaintext = fast_codec().decrypt_text(&blob, &h.key.to_hex()).unwrap();
    let elements: serde_json::Value = serde_json::from_str(&plaintext).unwrap();
    assert_eq!(elements, json!([{"id": "e1", "x": 1}]));
}

#[tokio::test]
async fn new_whiteboard_stays_unsaved_until_first_save() {
    let h = harness(MockApi::default(), false);
    edit(&h, "e1");
    assert_eq!(h.autosave.status(), SaveStatus::Unsaved);
    edit(&h, "e2");
    assert_eq!(h.autosave.status(), SaveStatus::Unsaved);
    h.autosave.tick(ConnectionStatus::Connected, true).await;
    assert_eq!(h.autosave.status(), SaveStatus::Saved);
}

// =============================================================================
// concurrency
// =============================================================================

#[tokio::test]
async fn edit_during_save_stays_dirty() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(MockApi { gate: Some(gate.clone()), ..MockApi::default() }, true);
    edit(&h, "e1");

    let saving = h.autosave.clone();
    let task = tokio::spawn(async move { saving.save_now().await });
    while h.api.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.autosave.status(), SaveStatus::Saving);

    edit(&h, "e2");
    assert_eq!(h.autosave.status(), SaveStatus::Saving);
    gate.add_permits(1);
    assert!(matches!(task.await.unwrap(), SaveOutcome::Saved { .. }));

    assert!(h.autosave.is_dirty());
    assert_eq!(h.autosave.status(), SaveStatus::Unsaved);
}

#[tokio::test]
async fn concurrent_save_reports_in_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(MockApi { gate: Some(gate.clone()), ..MockApi::default() }, true);
    edit(&h, "e1");

    let saving = h.autosave.clone();
    let task = tokio::spawn(async move { saving.save_now().await });
    while h.api.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.autosave.save_now().await, SaveOutcome::InFlight);
    gate.add_permits(1);
    assert!(matches!(task.await.unwrap(), SaveOutcome::Saved { .. }));
    assert_eq!(h.api.calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// failures + policy
// =============================================================================

#[tokio::test]
async fn failed_save_keeps_dirty_and_notifies() {
    let mut h = harness(MockApi::default(), true);
    h.api.fail.store(true, Ordering::SeqCst);
    edit(&h, "e1");

    let outcome = h.autosave.tick(ConnectionStatus::Connected, true).await;
    assert!(matches!(outcome, SaveOutcome::Failed(_)));
    assert_eq!(h.autosave.status(), SaveStatus::Unsaved);
    assert!(h.autosave.is_dirty());
    assert!(matches!(h.notices.recv().await.unwrap(), Notice::SaveFailed(_)));

    h.api.fail.store(false, Ordering::SeqCst);
    assert!(matches!(h.autosave.tick(ConnectionStatus::Connected, true).await, SaveOutcome::Saved { .. }));
    assert!(!h.autosave.is_dirty());
    assert!(matches!(h.notices.recv().await.unwrap(), Notice::Saved { .. }));
}

#[tokio::test]
async fn disconnected_tick_respects_policy() {
    let h = harness(MockApi::default(), true);
    edit(&h, "e1");
    assert_eq!(h.autosave.tick(ConnectionStatus::Disconnected, false).await, SaveOutcome::Deferred);
    assert_eq!(h.api.calls.load(Ordering::SeqCst), 0);

    assert!(matches!(
        h.autosave.tick(ConnectionStatus::Disconnected, true).await,
        SaveOutcome::Saved { .. }
    ));
}

#[tokio::test]
async fn explicit_save_ignores_policy_and_dirty_flag() {
    let h = harness(MockApi::default(), true);
    assert!(matches!(h.autosave.save_now().await, SaveOutcome::Saved { .. }));
    assert_eq!(h.api.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn completion_after_close_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(MockApi { gate: Some(gate.clone()), ..MockApi::default() }, true);
    edit(&h, "e1");

    let saving = h.autosave.clone();
    let task = tokio::spawn(async move { saving.save_now().await });
    while h.api.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    h.open.store(false, Ordering::SeqCst);
    gate.add_permits(1);

    assert_eq!(task.await.unwrap(), SaveOutcome::Closed);
    assert_eq!(h.autosave.last_saved_at(), None);
    assert_eq!(h.autosave.save_now().await, SaveOutcome::Closed);
}

// =============================================================================
// timer
// =============================================================================

#[tokio::test]
async fn timer_saves_dirty_document() {
    let h = harness(MockApi::default(), false);
    let (_conn_tx, conn_rx) = watch::channel(ConnectionStatus::Connected);
    let timer = h.autosave.spawn_timer(Duration::from_millis(20), conn_rx, true);

    edit(&h, "e1");
    let mut status = h.autosave.subscribe();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| *s == SaveStatus::Saved))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.api.calls.load(Ordering::SeqCst), 1);

    h.open.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(1), timer).await.unwrap().unwrap();
}

#[tokio::test]
async fn zero_interval_timer_still_saves() {
    let h = harness(MockApi::default(), false);
    let (_conn_tx, conn_rx) = watch::channel(ConnectionStatus::Connected);
    let timer = h.autosave.spawn_timer(Duration::ZERO, conn_rx, true);

    edit(&h, "e1");
    let mut status = h.autosave.subscribe();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| *s == SaveStatus::Saved))
        .await
        .unwrap()
        .unwrap();
    assert!(!timer.is_finished());

    h.open.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(1), timer).await.unwrap().unwrap();
}
