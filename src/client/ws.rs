//! WebSocket transport: `ws(s)://<host>/ws/{whiteboard_id}`, one JSON frame
//! per text message.
//!
//! Two pumps per connection. The outbound pump drains the link's sender into
//! the socket and closes the socket when the session drops its sender. The
//! inbound pump parses text messages into frames and ends the link when the
//! socket closes or errors.
//!
//! Opening the socket (TCP, TLS and the upgrade) is bounded by a connect
//! timeout, so a server that accepts but never answers still lets the
//! connection manager retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::{Link, Transport, TransportError};
use crate::frame::Frame;

const LINK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    /// `base_url` is the HTTP origin of the server, e.g. `https://host`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self { base_url: base_url.into(), connect_timeout }
    }

    #[must_use]
    pub fn shared(base_url: impl Into<String>, connect_timeout: Duration) -> Arc<dyn Transport> {
        Arc::new(Self::new(base_url, connect_timeout))
    }
}

/// Map an HTTP origin to the relay URL for a whiteboard.
///
/// # Errors
///
/// Returns `Connect` for origins that are neither `http://` nor `https://`.
pub fn relay_url(base_url: &str, whiteboard_id: Uuid) -> Result<String, TransportError> {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/ws/{whiteboard_id}"));
    }
    if let Some(rest) = base.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/ws/{whiteboard_id}"));
    }
    Err(TransportError::Connect(format!("unsupported base url: {base_url}")))
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, whiteboard_id: Uuid) -> Result<Link, TransportError> {
        let url = relay_url(&self.base_url, whiteboard_id)?;
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Connect(format!("no handshake within {:?}", self.connect_timeout)))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(LINK_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, syscall = %frame.syscall, "ws: frame encode failed");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "ws: send failed");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "ws: close failed");
            }
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(error = %e, "ws: recv failed");
                        break;
                    }
                };
                match message {
                    Message::Text(text) => match Frame::from_text(text.as_str()) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "ws: invalid inbound frame"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Link { tx: out_tx, rx: in_rx })
    }
}
