//! WebSocket Transport
//!
//! Streams device data to interactive clients. Two routes are served under
//! the configured base path:
//!
//! - `{base}/telemetry/{device_id}`: telemetry and status updates as JSON text
//! - `{base}/video/{device_id}`: binary video frames, one client per device
//!
//! Each connection runs a writer task that drains the connection's outbound
//! queue into the socket, and a reader loop that answers keepalives and
//! notices when the client goes away.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::fanout::{ConnectionHandle, ConnectionKind, OutboundFrame};
use crate::gateway::Gateway;
use crate::topic;

/// Time allowed for the closing handshake once a connection is done
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A resolved streaming endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: ConnectionKind,
    pub device_id: String,
}

/// Resolve a request path against the base path
pub fn parse_route(base: &str, path: &str) -> Option<Route> {
    let rest = path.strip_prefix(base.trim_end_matches('/'))?;
    let rest = rest.strip_prefix('/')?;
    let (kind, device_id) = rest.split_once('/')?;

    let kind = match kind {
        "telemetry" => ConnectionKind::Telemetry,
        "video" => ConnectionKind::Video,
        _ => return None,
    };
    topic::validate_device_id(device_id).ok()?;

    Some(Route {
        kind,
        device_id: device_id.to_string(),
    })
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// WebSocket listener bound to its address
pub struct WsServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    ws_path: String,
    idle_timeout: Duration,
}

impl WsServer {
    /// Bind the listener; connections are served once [`run`](Self::run) is called
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        config: &ServerConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gateway,
            ws_path: config.ws_path.clone(),
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!("WebSocket listening on {} (path: {})", addr, self.ws_path),
            Err(e) => warn!("WebSocket listener address unknown: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("New WebSocket connection from {}", addr);
                    if let Err(e) = super::configure_stream(&stream) {
                        debug!("Failed to configure socket for {}: {}", addr, e);
                    }
                    let gateway = Arc::clone(&self.gateway);
                    let ws_path = self.ws_path.clone();
                    let idle_timeout = self.idle_timeout;
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, gateway, ws_path, idle_timeout, cancel)
                            .await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept WebSocket connection: {}", e);
                }
            }
        }
        info!("WebSocket listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    ws_path: String,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut route = None;
    let handshake = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, response: Response| match parse_route(&ws_path, req.uri().path()) {
            Some(resolved) => {
                route = Some(resolved);
                Ok(response)
            }
            None => Err(reject(
                StatusCode::NOT_FOUND,
                format!("No stream at '{}'", req.uri().path()),
            )),
        },
    )
    .await;

    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let Some(route) = route else {
        return;
    };

    let (conn, handle) = match route.kind {
        ConnectionKind::Telemetry => gateway.register_telemetry_client(&route.device_id),
        ConnectionKind::Video => gateway.register_video_client(&route.device_id),
    };
    debug!(
        "{} stream {} for {} opened by {}",
        route.kind,
        conn.id(),
        route.device_id,
        addr
    );

    let (sink, mut incoming) = ws.split();
    let writer = spawn_writer(sink, handle);

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = conn.closed() => break,
            next = tokio::time::timeout(idle_timeout, incoming.next()) => next,
        };

        match next {
            Err(_) => {
                // Quiet client: probe it, the writer notices a dead socket
                if conn.try_send(OutboundFrame::Text("ping".to_string())).is_err() {
                    break;
                }
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if text.trim() == "ping" {
                    if conn.try_send(OutboundFrame::Text("pong".to_string())).is_err() {
                        break;
                    }
                } else {
                    debug!("Ignoring text from {} client {}", route.kind, conn.id());
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                debug!("WebSocket read error from {}: {}", addr, e);
                break;
            }
        }
    }

    match route.kind {
        ConnectionKind::Telemetry => {
            gateway.unregister_telemetry_client(&route.device_id, conn.id())
        }
        ConnectionKind::Video => gateway.unregister_video_client(&route.device_id, conn.id()),
    }
    conn.close();
    let _ = writer.await;
    debug!("{} stream {} for {} closed", route.kind, conn.id(), route.device_id);
}

fn to_message(frame: OutboundFrame) -> Option<Message> {
    match frame {
        OutboundFrame::Json(value) => Some(Message::Text(value.to_string())),
        OutboundFrame::Text(text) => Some(Message::Text(text)),
        OutboundFrame::Binary(bytes) => Some(Message::Binary(bytes.to_vec())),
        OutboundFrame::Close => None,
    }
}

/// Drain the outbound queue into the socket until closed or cancelled
fn spawn_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    handle: ConnectionHandle,
) -> JoinHandle<()> {
    let ConnectionHandle { mut rx, cancel } = handle;
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => frame,
                _ = cancel.cancelled() => break,
            };
            let Some(message) = frame.and_then(to_message) else {
                break;
            };

            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = sink.send(message) => sent,
            };
            if let Err(e) = sent {
                debug!("WebSocket write failed: {}", e);
                break;
            }
        }

        // Unblock the reader whatever ended the writer
        cancel.cancel();
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        assert_eq!(
            parse_route("/api/v1/ws", "/api/v1/ws/telemetry/d1"),
            Some(Route {
                kind: ConnectionKind::Telemetry,
                device_id: "d1".to_string()
            })
        );
        assert_eq!(
            parse_route("/api/v1/ws/", "/api/v1/ws/video/cam-2"),
            Some(Route {
                kind: ConnectionKind::Video,
                device_id: "cam-2".to_string()
            })
        );
    }

    #[test]
    fn test_parse_route_rejects_unknown_paths() {
        assert_eq!(parse_route("/api/v1/ws", "/api/v1/ws"), None);
        assert_eq!(parse_route("/api/v1/ws", "/api/v1/ws/telemetry"), None);
        assert_eq!(parse_route("/api/v1/ws", "/api/v1/ws/telemetry/"), None);
        assert_eq!(parse_route("/api/v1/ws", "/api/v1/ws/audio/d1"), None);
        assert_eq!(parse_route("/api/v1/ws", "/api/v1/ws/telemetry/d1/x"), None);
        assert_eq!(parse_route("/api/v1/ws", "/api/v1/wsx/telemetry/d1"), None);
        assert_eq!(parse_route("/api/v1/ws", "/other/telemetry/d1"), None);
        assert_eq!(parse_route("/api/v1/ws", "/api/v1/ws/telemetry/d+"), None);
    }

    #[test]
    fn test_frames_map_to_messages() {
        assert_eq!(
            to_message(OutboundFrame::Json(serde_json::json!({"a": 1}))),
            Some(Message::Text("{\"a\":1}".to_string()))
        );
        assert_eq!(
            to_message(OutboundFrame::Binary(bytes::Bytes::from_static(b"\x01\x02"))),
            Some(Message::Binary(vec![1, 2]))
        );
        assert_eq!(to_message(OutboundFrame::Close), None);
    }
}
