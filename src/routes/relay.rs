//! WebSocket relay: `GET /ws/{id}` joins the whiteboard's room.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID, joins the room and enters a `select!`
//! loop:
//! - Incoming client frames → validate → fan out to the other members
//! - Frames from peers → forward to this client
//!
//! The relay never reads `data`. Validation only checks that the text is a
//! frame and that it targets this connection's whiteboard; failures are
//! answered with an error frame to the sender alone.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → join room
//! 2. Relay frames both ways
//! 3. Close → part room (announces `peer:part` if the client sent anything)

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame};
use crate::services::room::CLIENT_CHANNEL_CAPACITY;
use crate::state::AppState;

/// Syscall of relay-originated error frames.
pub const RELAY_ERROR: &str = "relay:error";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("frame targets whiteboard {0}, connection is bound elsewhere")]
    WrongWhiteboard(Uuid),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidFrame(_) => "E_INVALID_FRAME",
            Self::WrongWhiteboard(_) => "E_WRONG_WHITEBOARD",
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, Path(id): Path<String>, ws: WebSocketUpgrade) -> Response {
    let Ok(whiteboard_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, "invalid whiteboard id").into_response();
    };
    ws.on_upgrade(move |socket| run_ws(socket, state, whiteboard_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, whiteboard_id: Uuid) {
    let client_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(CLIENT_CHANNEL_CAPACITY);
    state.rooms.join(whiteboard_id, client_id, client_tx).await;
    info!(%client_id, %whiteboard_id, "relay: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        if let Some(reply) = process_inbound_text(&state, whiteboard_id, client_id, text.as_str()).await {
                            if send_frame(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = client_rx.recv() => {
                // The room dropped our sender: we fell behind and were evicted.
                let Some(frame) = frame else { break };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    state.rooms.part(whiteboard_id, client_id).await;
    info!(%client_id, %whiteboard_id, "relay: client disconnected");
}

// =============================================================================
// FRAME HANDLING
// =============================================================================

/// Validate and fan out one inbound text frame. Returns the error reply for
/// the sender, if any.
pub(crate) async fn process_inbound_text(
    state: &AppState,
    whiteboard_id: Uuid,
    client_id: Uuid,
    text: &str,
) -> Option<Frame> {
    let frame = match Frame::from_text(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%client_id, error = %e, "relay: invalid inbound frame");
            let err = RelayError::InvalidFrame(e.to_string());
            return Some(Frame::request(RELAY_ERROR, Data::new()).error_from(&err));
        }
    };

    let frame = match frame.whiteboard_id {
        Some(target) if target != whiteboard_id => {
            warn!(%client_id, %target, %whiteboard_id, "relay: frame for another whiteboard");
            return Some(frame.error_from(&RelayError::WrongWhiteboard(target)));
        }
        Some(_) => frame,
        None => frame.with_whiteboard_id(whiteboard_id),
    };

    debug!(%client_id, syscall = %frame.syscall, status = ?frame.status, "relay: recv frame");
    state.rooms.publish(whiteboard_id, client_id, &frame).await;
    None
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    let text = match frame.to_text() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "relay: failed to serialize frame");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
