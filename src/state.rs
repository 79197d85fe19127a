//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the snapshot store (Postgres or memory) and the relay room
//! registry. Nothing about a whiteboard's content lives here: the server
//! only ever sees ciphertext, and only in passing.

use std::sync::Arc;

use crate::services::room::Rooms;
use crate::services::store::SnapshotStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SnapshotStore>,
    pub rooms: Rooms,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store, rooms: Rooms::new() }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
