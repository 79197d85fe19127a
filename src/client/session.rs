//! Document session: one open whiteboard and everything attached to it.
//!
//! LIFECYCLE
//! =========
//! 1. `open` fetches the stored snapshot, decrypts it off-thread and seeds an
//!    empty replica. A wrong key aborts with `SessionError::CannotOpen`; an
//!    unreachable server leaves the document empty and editable and queues a
//!    `Notice::LoadFailed`.
//! 2. The connection manager, the event loop, the presence heartbeat and the
//!    autosave timer are spawned.
//! 3. On every (re)connect the session sends `doc:sync` with its full state
//!    and re-publishes awareness; peers answer with theirs.
//! 4. `close` flips the open flag, says goodbye to peers and aborts every
//!    task. Completions that land afterwards are discarded.
//!
//! LOCK ORDER
//! ==========
//! pending → doc → binding; autosave state is never held with another lock.
//! Document listeners run under the doc lock and take the binding lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::autosave::{Autosave, AutosaveDeps, SaveOutcome, SaveStatus, since_last_save};
use super::binding::{PendingBinding, Scene, SceneBinding};
use super::connection::{ConnectionEvent, ConnectionManager, ConnectionStatus, Transport};
use super::doc::{Document, Edit, Element, ElementId, Mutation, PeerId, Update};
use super::lock;
use super::persistence::{PersistenceClient, PersistenceError, SnapshotApi};
use super::presence::{Awareness, AwarenessUpdate, PeerState, Point, PresenceEvent};
use super::ws::WsTransport;
use crate::config::{MIN_TIMER_PERIOD, SessionConfig};
use crate::crypto::{Codec, CryptoError, SessionKey, decrypt_off_thread};
use crate::frame::{
    AWARENESS_REMOVE, AWARENESS_UPDATE, DOC_SYNC, DOC_UPDATE, Data, ErrorCode, Frame, PEER_PART, Status,
};
use crate::share::{ShareLink, ShareLinkError};

const NOTICE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// ERRORS + NOTICES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Wrong key or corrupted ciphertext. Retrying with the same key is futile.
    #[error("cannot open whiteboard: {0}")]
    CannotOpen(#[source] CryptoError),
    #[error("stored snapshot is not an element list: {0}")]
    CorruptSnapshot(String),
    #[error(transparent)]
    ShareLink(#[from] ShareLinkError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::CannotOpen(_) => "E_CANNOT_OPEN",
            Self::CorruptSnapshot(_) => "E_CORRUPT_SNAPSHOT",
            Self::ShareLink(e) => e.error_code(),
            Self::Persistence(e) => e.error_code(),
        }
    }
}

/// Transient user-facing signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    LoadFailed(String),
    SaveFailed(String),
    Saved { updated_at: i64 },
    ConnectionLost,
    Reconnected,
}

/// Publish a notice; having no subscriber is fine.
pub(crate) fn publish_notice(notices: &broadcast::Sender<Notice>, notice: Notice) {
    if notices.receiver_count() == 0 {
        return;
    }
    if let Err(e) = notices.send(notice) {
        debug!(error = %e, "session: notice dropped");
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Collaborators a session talks to.
pub struct SessionParts {
    pub api: Arc<dyn SnapshotApi>,
    pub transport: Arc<dyn Transport>,
    pub codec: Codec,
    pub local_state: PeerState,
}

/// State shared with the spawned tasks.
struct Core {
    whiteboard_id: Uuid,
    peer_id: PeerId,
    doc: Arc<Mutex<Document>>,
    presence: Arc<Mutex<Awareness>>,
    connection: ConnectionManager,
    notices: broadcast::Sender<Notice>,
    open: Arc<AtomicBool>,
}

pub struct DocumentSession {
    core: Arc<Core>,
    link: ShareLink,
    autosave: Autosave,
    binding: Arc<Mutex<Option<SceneBinding>>>,
    pending: Mutex<PendingBinding>,
    initial_notices: Mutex<Option<broadcast::Receiver<Notice>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DocumentSession {
    /// Open a whiteboard from a share link string against the configured
    /// server, over WebSocket and HTTP.
    ///
    /// # Errors
    ///
    /// Malformed links, an HTTP client that cannot be built, and every error
    /// of [`DocumentSession::open`].
    pub async fn open_link(config: SessionConfig, link: &str, local_state: PeerState) -> Result<Self, SessionError> {
        let link = ShareLink::parse(link)?;
        let api = Arc::new(PersistenceClient::new(&config.base_url, config.persistence_timeout)?);
        let transport = WsTransport::shared(config.base_url.clone(), config.connect_timeout);
        Self::open(config, link, SessionParts { api, transport, codec: Codec::default(), local_state }).await
    }

    /// Load, seed and start syncing one whiteboard.
    ///
    /// # Errors
    ///
    /// `CannotOpen` when the stored snapshot does not decrypt under the
    /// link's key, `CorruptSnapshot` when it decrypts to something other than
    /// a JSON array. Persistence failures are not errors: the session opens
    /// empty and the first notice subscriber sees `Notice::LoadFailed`.
    pub async fn open(config: SessionConfig, link: ShareLink, parts: SessionParts) -> Result<Self, SessionError> {
        let whiteboard_id = link.whiteboard_id;
        let peer_id = Uuid::new_v4();
        let key = Arc::new(link.key.clone());
        let (notices, initial_rx) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));

        // PHASE: LOAD + SEED
        // WHY: the remote snapshot goes into an empty replica before any
        // listener, binding or connection exists, so seeding is not an edit.
        let mut document = Document::new(peer_id);
        let loaded = match load(&*parts.api, parts.codec, &key, whiteboard_id).await? {
            Loaded::Snapshot { values, updated_at } => {
                let generation = u64::try_from(updated_at).unwrap_or(0);
                let seeded = document.seed(values, generation);
                info!(%whiteboard_id, seeded, updated_at, "session: snapshot loaded");
                true
            }
            Loaded::Empty => {
                info!(%whiteboard_id, "session: new whiteboard");
                false
            }
            Loaded::Failed(message) => {
                warn!(%whiteboard_id, error = %message, "session: load failed, starting empty");
                publish_notice(&notices, Notice::LoadFailed(message));
                false
            }
        };
        let doc = Arc::new(Mutex::new(document));

        let autosave = Autosave::new(
            AutosaveDeps {
                whiteboard_id,
                doc: doc.clone(),
                api: parts.api,
                codec: parts.codec,
                key,
                notices: notices.clone(),
                open: open.clone(),
            },
            loaded,
        );

        // PHASE: WIRE LISTENERS
        let binding: Arc<Mutex<Option<SceneBinding>>> = Arc::new(Mutex::new(None));
        {
            let autosave = autosave.clone();
            let binding = binding.clone();
            lock(&doc).on_change(move |change_set| {
                autosave.mark_dirty();
                if let Some(binding) = lock(&binding).as_mut() {
                    binding.apply_change_set(change_set);
                }
            });
        }

        let mut awareness = Awareness::new(peer_id, config.presence_timeout);
        awareness.set_local_state(parts.local_state);
        let presence = Arc::new(Mutex::new(awareness));

        let mut pending = PendingBinding::new();
        pending.mark_seeded();

        // PHASE: START TASKS
        let (connection, events) = ConnectionManager::spawn(parts.transport, whiteboard_id, config.reconnect_backoff);
        let connection_rx = connection.subscribe();
        let core = Arc::new(Core { whiteboard_id, peer_id, doc, presence, connection, notices, open });

        let tasks = vec![
            tokio::spawn(run_events(core.clone(), events)),
            tokio::spawn(run_heartbeat(core.clone(), config.heartbeat_interval())),
            autosave.spawn_timer(config.autosave_interval, connection_rx, config.save_when_disconnected),
        ];
        info!(%whiteboard_id, %peer_id, "session: opened");

        Ok(Self {
            core,
            link,
            autosave,
            binding,
            pending: Mutex::new(pending),
            initial_notices: Mutex::new(Some(initial_rx)),
            tasks: Mutex::new(tasks),
        })
    }

    // -------------------------------------------------------------------------
    // IDENTITY
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn whiteboard_id(&self) -> Uuid {
        self.core.whiteboard_id
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.core.peer_id
    }

    /// The link to share, key included.
    #[must_use]
    pub fn share_url(&self) -> String {
        self.link.to_url()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.open.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // DOCUMENT
    // -------------------------------------------------------------------------

    /// Apply a local edit and broadcast it when connected. Returns whether
    /// the update reached the transport.
    pub fn apply_local(&self, mutation: Mutation) -> bool {
        if !self.is_open() || mutation.is_empty() {
            return false;
        }
        let update = lock(&self.core.doc).apply_local(mutation);
        self.core.broadcast_update(&update)
    }

    /// Visible elements in document order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Element> {
        lock(&self.core.doc).snapshot()
    }

    // -------------------------------------------------------------------------
    // SCENE
    // -------------------------------------------------------------------------

    /// Hand over the rendering surface. It is bound, and replaced with the
    /// document snapshot, once the document has been seeded.
    pub fn attach_scene(&self, scene: Box<dyn Scene>) {
        let mut pending = lock(&self.pending);
        pending.renderer_ready(scene);
        let doc = lock(&self.core.doc);
        let snapshot = doc.snapshot();
        if let Some(bound) = pending.try_bind(|| snapshot) {
            *lock(&self.binding) = Some(bound);
            debug!(whiteboard_id = %self.core.whiteboard_id, "session: scene bound");
        }
    }

    /// The host reports that the user changed the scene.
    ///
    /// The doc lock is held from the diff to the hide, so no remote merge
    /// can land between adopting the scene's values and stamping them.
    pub fn scene_changed(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let mut doc = lock(&self.core.doc);
        let mutation = {
            let mut binding = lock(&self.binding);
            let Some(binding) = binding.as_mut() else {
                return false;
            };
            let reported = binding.scene_elements();
            binding.local_change(&reported)
        };
        if mutation.is_empty() {
            return false;
        }

        let upserted: Vec<ElementId> = mutation
            .edits
            .iter()
            .filter_map(|edit| match edit {
                Edit::Upsert { id, .. } => Some(id.clone()),
                Edit::Delete { .. } => None,
            })
            .collect();

        // The binding lock is not held here: local listeners take it.
        let update = doc.apply_local(mutation);
        let hidden: Vec<ElementId> = upserted
            .into_iter()
            .filter(|id| doc.is_tombstoned(id))
            .collect();
        if !hidden.is_empty() {
            if let Some(binding) = lock(&self.binding).as_mut() {
                binding.hide(&hidden);
            }
        }
        drop(doc);
        self.core.broadcast_update(&update)
    }

    // -------------------------------------------------------------------------
    // PRESENCE
    // -------------------------------------------------------------------------

    /// Replace the local awareness state and publish it.
    pub fn set_local_state(&self, state: PeerState) {
        let update = lock(&self.core.presence).set_local_state(state);
        self.core.send_awareness(&update);
    }

    /// Publish a new pointer position (`None` when the pointer left).
    pub fn update_pointer(&self, cursor: Option<Point>) {
        let update = lock(&self.core.presence).update_local_at(Instant::now(), |state| state.cursor = cursor);
        self.core.send_awareness(&update);
    }

    /// Publish the bound scene's current viewport.
    pub fn update_viewport(&self) {
        let Some(viewport) = lock(&self.binding).as_ref().map(SceneBinding::viewport) else {
            return;
        };
        let update =
            lock(&self.core.presence).update_local_at(Instant::now(), |state| state.viewport = Some(viewport));
        self.core.send_awareness(&update);
    }

    /// Jump the bound scene to a peer's published viewport.
    pub fn follow_peer(&self, peer: PeerId) -> bool {
        let viewport = lock(&self.core.presence)
            .states()
            .into_iter()
            .find(|(id, _)| *id == peer)
            .and_then(|(_, state)| state.viewport);
        let Some(viewport) = viewport else {
            return false;
        };
        let mut binding = lock(&self.binding);
        let Some(binding) = binding.as_mut() else {
            return false;
        };
        binding.set_viewport(viewport);
        true
    }

    /// Live peers, the local one included.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        lock(&self.core.presence).peer_count()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<(PeerId, PeerState)> {
        lock(&self.core.presence).states()
    }

    pub fn on_presence(&self, listener: impl Fn(&PresenceEvent) + Send + Sync + 'static) {
        lock(&self.core.presence).on_update(listener);
    }

    // -------------------------------------------------------------------------
    // STATUS
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.core.connection.status()
    }

    #[must_use]
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.core.connection.subscribe()
    }

    #[must_use]
    pub fn save_status(&self) -> SaveStatus {
        self.autosave.status()
    }

    #[must_use]
    pub fn subscribe_save_status(&self) -> watch::Receiver<SaveStatus> {
        self.autosave.subscribe()
    }

    #[must_use]
    pub fn last_saved_at(&self) -> Option<i64> {
        self.autosave.last_saved_at()
    }

    #[must_use]
    pub fn since_last_save(&self, now_ms: i64) -> Option<std::time::Duration> {
        since_last_save(now_ms, self.autosave.last_saved_at())
    }

    /// Notices. The first subscriber also receives anything published while
    /// opening, such as `LoadFailed`.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        lock(&self.initial_notices)
            .take()
            .unwrap_or_else(|| self.core.notices.subscribe())
    }

    /// Save right away, dirty or not.
    pub async fn save_now(&self) -> SaveOutcome {
        self.autosave.save_now().await
    }

    // -------------------------------------------------------------------------
    // TEARDOWN
    // -------------------------------------------------------------------------

    /// Stop syncing. Idempotent; pending completions are discarded.
    pub fn close(&self) {
        if !self.core.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let goodbye = Frame::request(AWARENESS_REMOVE, Data::new())
            .with_whiteboard_id(self.core.whiteboard_id)
            .with_from(self.core.peer_id.to_string())
            .with_data("peer_id", self.core.peer_id.to_string());
        self.core.connection.send(goodbye);
        self.core.connection.close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        info!(whiteboard_id = %self.core.whiteboard_id, "session: closed");
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// LOAD
// =============================================================================

enum Loaded {
    Snapshot { values: Vec<Value>, updated_at: i64 },
    Empty,
    Failed(String),
}

async fn load(api: &dyn SnapshotApi, codec: Codec, key: &Arc<SessionKey>, whiteboard_id: Uuid) -> Result<Loaded, SessionError> {
    let stored = match api.fetch(whiteboard_id).await {
        Ok(Some(stored)) => stored,
        Ok(None) => return Ok(Loaded::Empty),
        Err(e) => return Ok(Loaded::Failed(e.to_string())),
    };
    let plaintext = decrypt_off_thread(codec, stored.encrypted_data, key.clone())
        .await
        .map_err(SessionError::CannotOpen)?;
    let values: Vec<Value> =
        serde_json::from_str(&plaintext).map_err(|e| SessionError::CorruptSnapshot(e.to_string()))?;
    Ok(Loaded::Snapshot { values, updated_at: stored.updated_at })
}

// =============================================================================
// OUTBOUND
// =============================================================================

impl Core {
    fn frame(&self, syscall: &str, data: Data) -> Frame {
        Frame::request(syscall, data)
            .with_whiteboard_id(self.whiteboard_id)
            .with_from(self.peer_id.to_string())
    }

    fn broadcast_update(&self, update: &Update) -> bool {
        if update.is_empty() {
            return false;
        }
        let Some(data) = update_data(update) else {
            return false;
        };
        self.connection.send(self.frame(DOC_UPDATE, data))
    }

    fn send_awareness(&self, update: &AwarenessUpdate) {
        if !self.open.load(Ordering::SeqCst) {
            return;
        }
        self.connection.send(self.frame(AWARENESS_UPDATE, update.to_data()));
    }

    fn send_sync_request(&self) {
        let full_state = lock(&self.doc).full_state();
        if let Some(data) = update_data(&full_state) {
            self.connection.send(self.frame(DOC_SYNC, data));
        }
    }

    fn publish_presence(&self) {
        let update = lock(&self.presence).publish_at(Instant::now());
        if let Some(update) = update {
            self.send_awareness(&update);
        }
    }
}

fn update_data(update: &Update) -> Option<Data> {
    match serde_json::to_value(update) {
        Ok(value) => {
            let mut data = Data::new();
            data.insert("update".into(), value);
            Some(data)
        }
        Err(e) => {
            warn!(error = %e, "session: update encode failed");
            None
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

async fn run_events(core: Arc<Core>, mut events: mpsc::Receiver<ConnectionEvent>) {
    let mut ever_connected = false;
    while let Some(event) = events.recv().await {
        if !core.open.load(Ordering::SeqCst) {
            break;
        }
        match event {
            ConnectionEvent::Connected => {
                if ever_connected {
                    publish_notice(&core.notices, Notice::Reconnected);
                }
                ever_connected = true;
                core.send_sync_request();
                core.publish_presence();
            }
            ConnectionEvent::Disconnected => {
                lock(&core.presence).clear_remote();
                publish_notice(&core.notices, Notice::ConnectionLost);
            }
            ConnectionEvent::Frame(frame) => handle_frame(&core, &frame),
        }
    }
}

fn handle_frame(core: &Core, frame: &Frame) {
    if frame.status == Status::Error {
        warn!(syscall = %frame.syscall, data = ?frame.data, "session: error frame");
        return;
    }

    match frame.syscall.as_str() {
        DOC_UPDATE => merge_update(core, frame),
        DOC_SYNC => {
            merge_update(core, frame);
            if frame.status == Status::Request {
                let full_state = lock(&core.doc).full_state();
                if let Some(data) = update_data(&full_state) {
                    let reply = frame
                        .done_with(data)
                        .with_whiteboard_id(core.whiteboard_id)
                        .with_from(core.peer_id.to_string());
                    core.connection.send(reply);
                }
                core.publish_presence();
            }
        }
        AWARENESS_UPDATE => match AwarenessUpdate::from_data(&frame.data) {
            Ok(update) => {
                lock(&core.presence).apply_remote(update);
            }
            Err(e) => warn!(error = %e, "session: malformed awareness update"),
        },
        AWARENESS_REMOVE | PEER_PART => {
            let Some(raw) = frame.data.get("peer_id").and_then(Value::as_str) else {
                warn!(syscall = %frame.syscall, "session: peer removal without peer_id");
                return;
            };
            match Uuid::parse_str(raw) {
                Ok(peer) => {
                    lock(&core.presence).remove_peer(peer);
                }
                Err(e) => warn!(syscall = %frame.syscall, error = %e, "session: malformed peer_id"),
            }
        }
        other => debug!(syscall = %other, "session: ignoring frame"),
    }
}

fn merge_update(core: &Core, frame: &Frame) {
    let Some(raw) = frame.data.get("update") else {
        warn!(syscall = %frame.syscall, "session: frame without update");
        return;
    };
    let update = Update::from_value_lenient(raw);
    let changes = lock(&core.doc).apply_remote(&update).changes.len();
    debug!(syscall = %frame.syscall, ops = update.ops.len(), changes, "session: merged");
}

// =============================================================================
// HEARTBEAT
// =============================================================================

async fn run_heartbeat(core: Arc<Core>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period.max(MIN_TIMER_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !core.open.load(Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        let update = {
            let mut presence = lock(&core.presence);
            let expired = presence.prune(now);
            if !expired.is_empty() {
                debug!(expired = expired.len(), "session: pruned silent peers");
            }
            if presence.heartbeat_due(now) { presence.publish_at(now) } else { None }
        };
        if let Some(update) = update {
            core.send_awareness(&update);
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
