//! Client sync core: everything one participant runs next to its renderer.
//!
//! ARCHITECTURE
//! ============
//! A `DocumentSession` owns one open whiteboard: the replicated document,
//! the awareness map, the connection manager, the autosave scheduler and the
//! scene binding. Nothing here is global; close the session and every task
//! it spawned goes with it.
//!
//! Leaf-first: `doc`, `presence` → `connection` (+ `ws`, `local` transports)
//! → `persistence` → `autosave` → `binding` → `session`.

pub mod autosave;
pub mod binding;
pub mod connection;
pub mod doc;
pub mod local;
pub mod persistence;
pub mod presence;
pub mod session;
pub mod ws;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use autosave::{SaveOutcome, SaveStatus};
pub use binding::{MemoryScene, PendingBinding, Scene, SceneBinding};
pub use connection::{ConnectionStatus, Transport};
pub use doc::{Document, Element, Mutation, Origin};
pub use local::LocalHub;
pub use persistence::{PersistenceClient, SnapshotApi};
pub use presence::{PeerState, Viewport};
pub use session::{DocumentSession, Notice, SessionError};
pub use ws::WsTransport;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
