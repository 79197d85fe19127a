//! In-process transport: a relay hub living in the same runtime.
//!
//! Each `connect` joins the hub's room for the whiteboard and spawns a pump
//! that forwards the client's outbound frames to the room. Dropping the
//! client's sender ends the pump and parts the room, which announces
//! `peer:part` exactly like the network relay.
//!
//! `set_online(false)` kicks every connection made through this handle (and
//! its clones) and refuses new ones, which is how tests simulate an outage.
//! `endpoint()` hands out a handle on the same rooms with its own switch, so
//! one peer can be offline while another is not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::connection::{Link, Transport, TransportError};
use super::lock;
use crate::frame::Frame;
use crate::services::room::{CLIENT_CHANNEL_CAPACITY, Rooms};

#[derive(Clone)]
pub struct LocalHub {
    rooms: Rooms,
    online: Arc<AtomicBool>,
    clients: Arc<Mutex<Vec<(Uuid, Uuid)>>>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self { rooms: Rooms::new(), online: Arc::new(AtomicBool::new(true)), clients: Arc::default() }
    }

    /// Another handle on the same rooms with its own online switch.
    #[must_use]
    pub fn endpoint(&self) -> Self {
        Self { rooms: self.rooms.clone(), online: Arc::new(AtomicBool::new(true)), clients: Arc::default() }
    }

    /// A transport handle bound to this hub.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Going offline drops this handle's live connections on `whiteboard_id`
    /// and refuses new ones until it is back online.
    pub async fn set_online(&self, online: bool, whiteboard_id: Uuid) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            return;
        }
        let kicked: Vec<Uuid> = {
            let mut clients = lock(&self.clients);
            let (kicked, kept): (Vec<_>, Vec<_>) = clients.drain(..).partition(|(wb, _)| *wb == whiteboard_id);
            *clients = kept;
            kicked.into_iter().map(|(_, client_id)| client_id).collect()
        };
        for client_id in kicked {
            self.rooms.part(whiteboard_id, client_id).await;
        }
    }

    pub async fn client_count(&self, whiteboard_id: Uuid) -> usize {
        self.rooms.client_count(whiteboard_id).await
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn connect(&self, whiteboard_id: Uuid) -> Result<Link, TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("local hub offline".into()));
        }

        let client_id = Uuid::new_v4();
        let (to_client_tx, to_client_rx) = mpsc::channel::<Frame>(CLIENT_CHANNEL_CAPACITY);
        let (from_client_tx, mut from_client_rx) = mpsc::channel::<Frame>(CLIENT_CHANNEL_CAPACITY);
        self.rooms.join(whiteboard_id, client_id, to_client_tx).await;
        lock(&self.clients).push((whiteboard_id, client_id));

        let rooms = self.rooms.clone();
        let clients = self.clients.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_client_rx.recv().await {
                rooms.publish(whiteboard_id, client_id, &frame).await;
            }
            lock(&clients).retain(|(_, id)| *id != client_id);
            rooms.part(whiteboard_id, client_id).await;
        });

        Ok(Link { tx: from_client_tx, rx: to_client_rx })
    }
}
