//! Live client connections
//!
//! The fan-out side only ever enqueues: every connection owns a bounded
//! outbound queue drained by its own writer task, so a slow or dead client
//! never stalls a broadcast.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a connection streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Telemetry,
    Video,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Telemetry => write!(f, "telemetry"),
            ConnectionKind::Video => write!(f, "video"),
        }
    }
}

/// Frame queued for a client
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// JSON document sent as a text frame
    Json(Value),
    /// Raw text frame
    Text(String),
    /// Binary frame (video)
    Binary(Bytes),
    /// Close the socket
    Close,
}

/// Why a send failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The client is not keeping up
    Full,
    /// The connection is gone
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full => write!(f, "outbound queue full"),
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Registry-side handle on one client
#[derive(Debug, Clone)]
pub struct LiveConnection {
    id: ConnectionId,
    device_id: String,
    kind: ConnectionKind,
    tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

/// Socket-side half: the writer task drains `rx` until `cancel` fires
#[derive(Debug)]
pub struct ConnectionHandle {
    pub rx: mpsc::Receiver<OutboundFrame>,
    pub cancel: CancellationToken,
}

impl LiveConnection {
    /// Create a connection with an outbound queue of `capacity` frames
    pub fn new(
        device_id: impl Into<String>,
        kind: ConnectionKind,
        capacity: usize,
    ) -> (Self, ConnectionHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let conn = Self {
            id: ConnectionId::next(),
            device_id: device_id.into(),
            kind,
            tx,
            cancel: cancel.clone(),
        };
        (conn, ConnectionHandle { rx, cancel })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the client to close, then stop the writer
    pub fn close(&self) {
        let _ = self.tx.try_send(OutboundFrame::Close);
        self.cancel.cancel();
    }

    /// Resolves once the connection is closed by anyone holding it
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique() {
        let (a, _ha) = LiveConnection::new("d1", ConnectionKind::Telemetry, 4);
        let (b, _hb) = LiveConnection::new("d1", ConnectionKind::Telemetry, 4);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.device_id(), "d1");
        assert_eq!(a.kind(), ConnectionKind::Telemetry);
    }

    #[test]
    fn test_full_queue_fails_send() {
        let (conn, mut handle) = LiveConnection::new("d1", ConnectionKind::Telemetry, 1);
        conn.try_send(OutboundFrame::Json(json!({"n": 1}))).unwrap();
        assert_eq!(
            conn.try_send(OutboundFrame::Json(json!({"n": 2}))),
            Err(SendError::Full)
        );
        assert_eq!(
            handle.rx.try_recv().unwrap(),
            OutboundFrame::Json(json!({"n": 1}))
        );
    }

    #[test]
    fn test_dropped_receiver_fails_send() {
        let (conn, handle) = LiveConnection::new("d1", ConnectionKind::Video, 4);
        drop(handle);
        assert_eq!(
            conn.try_send(OutboundFrame::Binary(Bytes::from_static(b"\x00"))),
            Err(SendError::Closed)
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn test_close_cancels_and_queues_close_frame() {
        let (conn, mut handle) = LiveConnection::new("d1", ConnectionKind::Video, 4);
        conn.close();
        assert!(handle.cancel.is_cancelled());
        assert_eq!(handle.rx.try_recv().unwrap(), OutboundFrame::Close);
        assert_eq!(
            conn.try_send(OutboundFrame::Text("late".into())),
            Err(SendError::Closed)
        );
    }
}
