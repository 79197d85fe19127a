//! Relay rooms: per-whiteboard fan-out of frames between live connections.
//!
//! DESIGN
//! ======
//! A room exists while at least one connection is joined. The relay is blind
//! to payloads: it forwards every frame to every other connection of the same
//! whiteboard and remembers the `from` peer id of each connection so it can
//! announce `peer:part` when that connection goes away.
//!
//! Slow consumers are not awaited. A connection whose buffer is full is
//! evicted on the spot: its sender is dropped, which ends its socket loop, so
//! the client reconnects and catches up through `doc:sync`. Evicting an
//! identified connection announces `peer:part` like any other departure.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, PEER_PART};

/// Outbound buffer per connection.
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

struct Member {
    tx: mpsc::Sender<Frame>,
    peer_id: Option<String>,
}

#[derive(Default)]
struct Room {
    members: HashMap<Uuid, Member>,
}

/// Registry of live rooms keyed by whiteboard id.
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<RwLock<HashMap<Uuid, Room>>>,
}

impl Rooms {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a whiteboard's room, creating the room if needed.
    pub async fn join(&self, whiteboard_id: Uuid, client_id: Uuid, tx: mpsc::Sender<Frame>) {
        let mut rooms = self.inner.write().await;
        let room = rooms.entry(whiteboard_id).or_default();
        room.members.insert(client_id, Member { tx, peer_id: None });
        info!(%whiteboard_id, %client_id, clients = room.members.len(), "room: client joined");
    }

    /// Forward a frame from `client_id` to every other member.
    pub async fn publish(&self, whiteboard_id: Uuid, client_id: Uuid, frame: &Frame) {
        let mut rooms = self.inner.write().await;
        let Some(room) = rooms.get_mut(&whiteboard_id) else {
            return;
        };
        if let (Some(member), Some(from)) = (room.members.get_mut(&client_id), frame.from.as_ref()) {
            if member.peer_id.is_none() {
                member.peer_id = Some(from.clone());
            }
        }
        broadcast(whiteboard_id, room, frame, Some(client_id));
        if room.members.is_empty() {
            rooms.remove(&whiteboard_id);
            debug!(%whiteboard_id, "room: evicted");
        }
    }

    /// Remove a connection. Announces `peer:part` to the rest when the
    /// connection ever identified itself, and evicts the room once empty.
    pub async fn part(&self, whiteboard_id: Uuid, client_id: Uuid) {
        let mut rooms = self.inner.write().await;
        let Some(room) = rooms.get_mut(&whiteboard_id) else {
            return;
        };
        let Some(member) = room.members.remove(&client_id) else {
            return;
        };
        info!(%whiteboard_id, %client_id, remaining = room.members.len(), "room: client left");

        if let Some(peer_id) = member.peer_id {
            broadcast(whiteboard_id, room, &part_frame(whiteboard_id, peer_id), None);
        }

        if room.members.is_empty() {
            rooms.remove(&whiteboard_id);
            debug!(%whiteboard_id, "room: evicted");
        }
    }

    /// Live connections on a whiteboard.
    pub async fn client_count(&self, whiteboard_id: Uuid) -> usize {
        let rooms = self.inner.read().await;
        rooms.get(&whiteboard_id).map_or(0, |room| room.members.len())
    }
}

fn part_frame(whiteboard_id: Uuid, peer_id: String) -> Frame {
    let mut data = Data::new();
    data.insert("peer_id".into(), serde_json::Value::String(peer_id));
    Frame::request(PEER_PART, data).with_whiteboard_id(whiteboard_id)
}

/// Fan `frame` out to every member but `exclude`. Members with a full buffer
/// are removed, and their departure is fanned out in turn.
fn broadcast(whiteboard_id: Uuid, room: &mut Room, frame: &Frame, exclude: Option<Uuid>) {
    let mut queue = vec![(frame.clone(), exclude)];
    while let Some((frame, exclude)) = queue.pop() {
        let mut lagging = Vec::new();
        for (client_id, member) in &room.members {
            if Some(*client_id) == exclude {
                continue;
            }
            match member.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => lagging.push(*client_id),
                Err(e @ TrySendError::Closed(_)) => {
                    debug!(%client_id, error = %e, syscall = %frame.syscall, "room: dropped frame");
                }
            }
        }
        for client_id in lagging {
            let Some(member) = room.members.remove(&client_id) else {
                continue;
            };
            warn!(%whiteboard_id, %client_id, syscall = %frame.syscall, "room: client lagging, evicted");
            if let Some(peer_id) = member.peer_id {
                queue.push((part_frame(whiteboard_id, peer_id), None));
            }
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
