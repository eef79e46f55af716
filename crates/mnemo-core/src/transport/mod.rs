//! Framed byte transports for worker sessions.
//!
//! A transport carries whole JSON text frames in both directions. The
//! production implementation wraps an axum WebSocket; the in-memory duplex
//! pair backs tests and loopback wiring.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

/// A bidirectional framed transport. One frame = one JSON object.
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Receive the next text frame. `None` means the peer closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the transport. Best-effort; errors are swallowed.
    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Transport over an accepted axum WebSocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                // axum answers pings itself; binary frames are not part of
                // the protocol and are skipped rather than fatal.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

// ---------------------------------------------------------------------------
// In-memory duplex
// ---------------------------------------------------------------------------

/// In-memory transport endpoint. [`duplex`] returns a connected pair.
pub struct ChannelTransport {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

/// Create a connected transport pair with the given per-direction buffer.
pub fn duplex(buffer: usize) -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::channel(buffer);
    let (b_tx, b_rx) = mpsc::channel(buffer);
    (
        ChannelTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        ChannelTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        // Dropping the sender signals EOF to the peer's recv.
        self.tx = None;
    }
}
