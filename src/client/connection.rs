//! Transport connection manager: owns the frame channel for one open
//! whiteboard and keeps it alive.
//!
//! LIFECYCLE
//! =========
//! 1. `spawn` → `Connecting`
//! 2. Transport connects → `Connected`, `ConnectionEvent::Connected`
//! 3. Link drops → `Disconnected`, `ConnectionEvent::Disconnected`
//! 4. Sleep the fixed backoff → back to 1, for as long as the session is open
//! 5. `close` → `Closed`; the loop is aborted and never restarts
//!
//! While not connected, `send` refuses frames. Nothing is queued: on the next
//! connect the session exchanges full state instead of replaying ops.
//!
//! A full outbound buffer drops awareness frames, which the next heartbeat
//! repeats anyway. A `doc:*` frame that does not fit resets the link instead,
//! so the reconnect's `doc:sync` carries what was lost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lock;
use crate::frame::{DOC_SYNC, DOC_UPDATE, Frame};

/// Buffer for inbound connection events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// TRANSPORT BOUNDARY
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport closed")]
    Closed,
}

impl crate::frame::ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        "E_TRANSPORT"
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// A live frame channel pair. Dropping `tx` ends the connection; `rx`
/// yielding `None` means the remote side is gone.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

/// Anything that can open a frame channel for a whiteboard.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, whiteboard_id: Uuid) -> Result<Link, TransportError>;
}

// =============================================================================
// STATUS + EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Frame(Frame),
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct ConnectionManager {
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Frame>>>>,
    reset: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Start the connect/reconnect loop. Inbound frames and lifecycle events
    /// arrive on the returned receiver.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        whiteboard_id: Uuid,
        backoff: Duration,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let outbound = Arc::new(Mutex::new(None));
        let reset = Arc::new(Notify::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let task = tokio::spawn(run(
            transport,
            whiteboard_id,
            backoff,
            status_tx.clone(),
            outbound.clone(),
            reset.clone(),
            events_tx,
        ));

        (Self { status_tx, outbound, reset, task }, events_rx)
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Watch status transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Send a frame if connected. Returns `false` when the frame was not
    /// handed to the transport.
    pub fn send(&self, frame: Frame) -> bool {
        if self.status() != ConnectionStatus::Connected {
            return false;
        }
        let mut outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) if is_document_frame(&frame) => {
                warn!(syscall = %frame.syscall, "connection: outbound backlog, resetting link");
                *outbound = None;
                self.reset.notify_one();
                false
            }
            Err(e) => {
                debug!(error = %e, "connection: outbound frame dropped");
                false
            }
        }
    }

    /// Tear down for good. Idempotent.
    pub fn close(&self) {
        self.task.abort();
        *lock(&self.outbound) = None;
        self.status_tx.send_modify(|status| *status = ConnectionStatus::Closed);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_document_frame(frame: &Frame) -> bool {
    frame.syscall == DOC_UPDATE || frame.syscall == DOC_SYNC
}

/// Move to `next` unless already closed. Returns whether the value changed.
fn set_status(status_tx: &watch::Sender<ConnectionStatus>, next: ConnectionStatus) -> bool {
    status_tx.send_if_modified(|current| {
        if *current == ConnectionStatus::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

async fn run(
    transport: Arc<dyn Transport>,
    whiteboard_id: Uuid,
    backoff: Duration,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Frame>>>>,
    reset: Arc<Notify>,
    events_tx: mpsc::Sender<ConnectionEvent>,
) {
    loop {
        set_status(&status_tx, ConnectionStatus::Connecting);

        match transport.connect(whiteboard_id).await {
            Ok(link) => {
                let Link { tx, mut rx } = link;
                *lock(&outbound) = Some(tx);
                set_status(&status_tx, ConnectionStatus::Connected);
                info!(%whiteboard_id, "connection: connected");
                if events_tx.send(ConnectionEvent::Connected).await.is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        frame = rx.recv() => {
                            let Some(frame) = frame else { break };
                            if events_tx.send(ConnectionEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        () = reset.notified() => break,
                    }
                }
                drop(rx);

                *lock(&outbound) = None;
                set_status(&status_tx, ConnectionStatus::Disconnected);
                warn!(%whiteboard_id, "connection: lost");
                if events_tx.send(ConnectionEvent::Disconnected).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                set_status(&status_tx, ConnectionStatus::Disconnected);
                warn!(%whiteboard_id, error = %e, ?backoff, "connection: connect failed");
            }
        }

        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
