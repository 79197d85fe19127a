//! Presence/awareness: ephemeral per-peer metadata (name, color, cursor,
//! viewport) that rides the same frame stream as document updates but is
//! never persisted or merged into the document.
//!
//! DESIGN
//! ======
//! - One entry per peer id, replaced wholesale on every publish. A per-peer
//!   clock rejects reordered stale publishes.
//! - Remote entries carry a `last_seen` instant; anything silent for longer
//!   than the timeout is pruned. The local peer re-publishes every
//!   `timeout / 2`.
//! - Time-dependent operations take `now` explicitly (`*_at`) so tests drive
//!   them without sleeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::doc::PeerId;
use crate::frame::Data;

// =============================================================================
// TYPES
// =============================================================================

/// Pointer position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Scroll offset and zoom of a peer's view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { scroll_x: 0.0, scroll_y: 0.0, zoom: 1.0 }
    }
}

/// What a peer tells everyone else about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Point>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

/// One publish, as carried by an `awareness:update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub peer_id: PeerId,
    pub clock: u64,
    pub state: PeerState,
}

impl AwarenessUpdate {
    /// Frame payload: `peer_id`, `clock`, `state`.
    #[must_use]
    pub fn to_data(&self) -> Data {
        let mut data = Data::new();
        data.insert("peer_id".into(), Value::String(self.peer_id.to_string()));
        data.insert("clock".into(), Value::from(self.clock));
        data.insert(
            "state".into(),
            serde_json::to_value(&self.state).unwrap_or(Value::Null),
        );
        data
    }

    /// Parse a frame payload.
    ///
    /// # Errors
    ///
    /// Returns the serde error when a field is missing or mistyped.
    pub fn from_data(data: &Data) -> Result<Self, serde_json::Error> {
        let object: serde_json::Map<String, Value> = data.clone().into_iter().collect();
        serde_json::from_value(Value::Object(object))
    }
}

/// What changed in the awareness map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Updated(PeerId),
    Removed(PeerId),
    /// All remote peers dropped, e.g. on disconnect.
    Cleared,
}

type PresenceListener = Box<dyn Fn(&PresenceEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct RemotePeer {
    clock: u64,
    state: PeerState,
    last_seen: Instant,
}

// =============================================================================
// AWARENESS
// =============================================================================

/// Awareness map for one open whiteboard.
pub struct Awareness {
    local_peer: PeerId,
    local_clock: u64,
    local: Option<PeerState>,
    last_published: Option<Instant>,
    remote: HashMap<PeerId, RemotePeer>,
    timeout: Duration,
    listeners: Vec<PresenceListener>,
}

pub type SharedPresence = Arc<Mutex<Awareness>>;

impl Awareness {
    #[must_use]
    pub fn new(local_peer: PeerId, timeout: Duration) -> Self {
        Self {
            local_peer,
            local_clock: 0,
            local: None,
            last_published: None,
            remote: HashMap::new(),
            timeout,
            listeners: Vec::new(),
        }
    }

    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Register a listener, called synchronously on every visible change.
    pub fn on_update(&mut self, listener: impl Fn(&PresenceEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Replace the local state and return the publish to broadcast.
    pub fn set_local_state(&mut self, state: PeerState) -> AwarenessUpdate {
        self.set_local_state_at(state, Instant::now())
    }

    pub fn set_local_state_at(&mut self, state: PeerState, now: Instant) -> AwarenessUpdate {
        self.local_clock += 1;
        self.last_published = Some(now);
        self.local = Some(state.clone());
        self.emit(&PresenceEvent::Updated(self.local_peer));
        AwarenessUpdate { peer_id: self.local_peer, clock: self.local_clock, state }
    }

    /// Edit the local state in place, e.g. to move the cursor.
    pub fn update_local_at(&mut self, now: Instant, edit: impl FnOnce(&mut PeerState)) -> AwarenessUpdate {
        let mut state = self.local.clone().unwrap_or_default();
        edit(&mut state);
        self.set_local_state_at(state, now)
    }

    #[must_use]
    pub fn local_state(&self) -> Option<&PeerState> {
        self.local.as_ref()
    }

    /// Re-publish the current local state with a fresh clock. `None` until a
    /// local state exists.
    pub fn publish_at(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let state = self.local.clone()?;
        self.local_clock += 1;
        self.last_published = Some(now);
        Some(AwarenessUpdate { peer_id: self.local_peer, clock: self.local_clock, state })
    }

    /// Whether the local state is due for a heartbeat publish.
    #[must_use]
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        if self.local.is_none() {
            return false;
        }
        self.last_published
            .is_none_or(|last| now.saturating_duration_since(last) >= self.timeout / 2)
    }

    /// Accept a remote publish. Stale clocks and our own echo are ignored.
    /// Returns `true` if the stored state changed.
    pub fn apply_remote(&mut self, update: AwarenessUpdate) -> bool {
        self.apply_remote_at(update, Instant::now())
    }

    pub fn apply_remote_at(&mut self, update: AwarenessUpdate, now: Instant) -> bool {
        if update.peer_id == self.local_peer {
            return false;
        }
        match self.remote.get_mut(&update.peer_id) {
            Some(existing) if update.clock < existing.clock => false,
            Some(existing) => {
                existing.last_seen = now;
                existing.clock = update.clock;
                if existing.state == update.state {
                    return false;
                }
                existing.state = update.state;
                self.emit(&PresenceEvent::Updated(update.peer_id));
                true
            }
            None => {
                self.remote.insert(
                    update.peer_id,
                    RemotePeer { clock: update.clock, state: update.state, last_seen: now },
                );
                self.emit(&PresenceEvent::Updated(update.peer_id));
                true
            }
        }
    }

    /// Drop a peer (clean leave or relay `peer:part`).
    pub fn remove_peer(&mut self, peer: PeerId) -> bool {
        if self.remote.remove(&peer).is_none() {
            return false;
        }
        self.emit(&PresenceEvent::Removed(peer));
        true
    }

    /// Remove every remote peer silent for longer than the timeout.
    pub fn prune(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.timeout;
        let expired: Vec<PeerId> = self
            .remote
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.remove_peer(*id);
        }
        expired
    }

    /// Forget all remote peers.
    pub fn clear_remote(&mut self) {
        if self.remote.is_empty() {
            return;
        }
        self.remote.clear();
        self.emit(&PresenceEvent::Cleared);
    }

    /// Every live state, local first, then remotes by peer id.
    #[must_use]
    pub fn states(&self) -> Vec<(PeerId, PeerState)> {
        let mut remotes: Vec<_> = self
            .remote
            .iter()
            .map(|(id, peer)| (*id, peer.state.clone()))
            .collect();
        remotes.sort_by_key(|(id, _)| *id);

        let mut states = Vec::with_capacity(remotes.len() + 1);
        if let Some(local) = &self.local {
            states.push((self.local_peer, local.clone()));
        }
        states.extend(remotes);
        states
    }

    /// Live states including the local one.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.remote.len() + usize::from(self.local.is_some())
    }

    fn emit(&self, event: &PresenceEvent) {
        for listener in &self.listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("local_peer", &self.local_peer)
            .field("local_clock", &self.local_clock)
            .field("remote", &self.remote.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
