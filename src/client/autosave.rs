//! Autosave scheduler and save status.
//!
//! DESIGN
//! ======
//! Status machine: `Saved → Unsaved → Saving → Saved`, or `Saving → Unsaved`
//! when the save fails or the document changed while it was in flight.
//!
//! - Every merged mutation bumps a dirty generation. A save captures the
//!   generation it started from and only acknowledges that one, so edits that
//!   land mid-save stay dirty.
//! - One save at a time. A second caller gets `SaveOutcome::InFlight`.
//! - Timer ticks save only when dirty and when the connection policy allows;
//!   explicit saves skip both checks.
//! - A completion that arrives after the session closed changes nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::ConnectionStatus;
use super::doc::Document;
use super::lock;
use super::persistence::SnapshotApi;
use super::session::{Notice, publish_notice};
use crate::config::MIN_TIMER_PERIOD;
use crate::crypto::{Codec, SessionKey, encrypt_off_thread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    Unsaved,
    Saving,
}

/// What a save attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { updated_at: i64 },
    /// Nothing to save.
    Clean,
    /// Another save is running.
    InFlight,
    /// Connection policy forbids saving right now.
    Deferred,
    Failed(String),
    /// The session closed before the save completed.
    Closed,
}

/// Time elapsed since the last successful save, derived on demand.
#[must_use]
pub fn since_last_save(now_ms: i64, last_saved_at: Option<i64>) -> Option<Duration> {
    let last = last_saved_at?;
    let elapsed = u64::try_from(now_ms.saturating_sub(last)).unwrap_or(0);
    Some(Duration::from_millis(elapsed))
}

/// Whether a timer tick may save under the given connection status.
#[must_use]
pub fn policy_allows(connection: ConnectionStatus, save_when_disconnected: bool) -> bool {
    match connection {
        ConnectionStatus::Closed => false,
        ConnectionStatus::Connected => true,
        ConnectionStatus::Connecting | ConnectionStatus::Disconnected => save_when_disconnected,
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Everything a save needs.
pub struct AutosaveDeps {
    pub whiteboard_id: Uuid,
    pub doc: Arc<Mutex<Document>>,
    pub api: Arc<dyn SnapshotApi>,
    pub codec: Codec,
    pub key: Arc<SessionKey>,
    pub notices: broadcast::Sender<Notice>,
    pub open: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct SaveState {
    generation: u64,
    saved_generation: u64,
    in_flight: bool,
    last_saved_at: Option<i64>,
}

struct Inner {
    deps: AutosaveDeps,
    state: Mutex<SaveState>,
    status_tx: watch::Sender<SaveStatus>,
}

#[derive(Clone)]
pub struct Autosave {
    inner: Arc<Inner>,
}

impl Autosave {
    /// `loaded` is true when an existing snapshot was loaded, which makes the
    /// initial status `Saved`; a brand-new whiteboard starts `Unsaved`.
    #[must_use]
    pub fn new(deps: AutosaveDeps, loaded: bool) -> Self {
        let initial = if loaded { SaveStatus::Saved } else { SaveStatus::Unsaved };
        let (status_tx, _) = watch::channel(initial);
        Self { inner: Arc::new(Inner { deps, state: Mutex::new(SaveState::default()), status_tx }) }
    }

    #[must_use]
    pub fn status(&self) -> SaveStatus {
        *self.inner.status_tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.inner.status_tx.subscribe()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let state = lock(&self.inner.state);
        state.generation != state.saved_generation
    }

    #[must_use]
    pub fn last_saved_at(&self) -> Option<i64> {
        lock(&self.inner.state).last_saved_at
    }

    /// Record that the document changed.
    pub fn mark_dirty(&self) {
        let in_flight = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.in_flight
        };
        if !in_flight {
            self.set_status(SaveStatus::Unsaved);
        }
    }

    /// Timer entry point: save if dirty and the policy allows it.
    pub async fn tick(&self, connection: ConnectionStatus, save_when_disconnected: bool) -> SaveOutcome {
        if !self.is_dirty() {
            return SaveOutcome::Clean;
        }
        if !policy_allows(connection, save_when_disconnected) {
            debug!(whiteboard_id = %self.inner.deps.whiteboard_id, ?connection, "autosave: deferred by policy");
            return SaveOutcome::Deferred;
        }
        self.save().await
    }

    /// Explicit save: runs even when clean or disconnected.
    pub async fn save_now(&self) -> SaveOutcome {
        self.save().await
    }

    async fn save(&self) -> SaveOutcome {
        let deps = &self.inner.deps;
        if !deps.open.load(Ordering::SeqCst) {
            return SaveOutcome::Closed;
        }

        // PHASE: CLAIM THE IN-FLIGHT SLOT
        let generation = {
            let mut state = lock(&self.inner.state);
            if state.in_flight {
                return SaveOutcome::InFlight;
            }
            state.in_flight = true;
            state.generation
        };
        self.set_status(SaveStatus::Saving);

        // PHASE: SNAPSHOT → JSON → ENCRYPT → STORE
        // WHY: the document lock is held only for the snapshot; crypto and
        // I/O run without it.
        let result = self.encrypt_and_store().await;

        let mut state = lock(&self.inner.state);
        state.in_flight = false;
        if !deps.open.load(Ordering::SeqCst) {
            return SaveOutcome::Closed;
        }

        match result {
            Ok(updated_at) => {
                state.saved_generation = state.saved_generation.max(generation);
                state.last_saved_at = Some(updated_at);
                let clean = state.generation == state.saved_generation;
                drop(state);
                self.set_status(if clean { SaveStatus::Saved } else { SaveStatus::Unsaved });
                info!(whiteboard_id = %deps.whiteboard_id, updated_at, clean, "autosave: saved");
                publish_notice(&deps.notices, Notice::Saved { updated_at });
                SaveOutcome::Saved { updated_at }
            }
            Err(message) => {
                drop(state);
                self.set_status(SaveStatus::Unsaved);
                warn!(whiteboard_id = %deps.whiteboard_id, error = %message, "autosave: save failed");
                publish_notice(&deps.notices, Notice::SaveFailed(message.clone()));
                SaveOutcome::Failed(message)
            }
        }
    }

    async fn encrypt_and_store(&self) -> Result<i64, String> {
        let deps = &self.inner.deps;
        let elements = lock(&deps.doc).snapshot();
        let plaintext = serde_json::to_string(&elements).map_err(|e| e.to_string())?;
        let ciphertext = encrypt_off_thread(deps.codec, plaintext, deps.key.clone())
            .await
            .map_err(|e| e.to_string())?;
        let receipt = deps
            .api
            .store(deps.whiteboard_id, ciphertext)
            .await
            .map_err(|e| e.to_string())?;
        Ok(receipt.updated_at)
    }

    fn set_status(&self, next: SaveStatus) {
        self.inner.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Periodic autosave for one session. A zero `interval` is raised to
    /// `MIN_TIMER_PERIOD`.
    pub fn spawn_timer(
        &self,
        interval: Duration,
        connection: watch::Receiver<ConnectionStatus>,
        save_when_disconnected: bool,
    ) -> JoinHandle<()> {
        let autosave = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_TIMER_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !autosave.inner.deps.open.load(Ordering::SeqCst) {
                    break;
                }
                let status = *connection.borrow();
                autosave.tick(status, save_when_disconnected).await;
            }
        })
    }
}

#[cfg(test)]
#[path = "autosave_test.rs"]
mod tests;
