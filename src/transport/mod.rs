//! Transport Layer
//!
//! Serves the streaming WebSocket endpoints for interactive clients.

mod websocket;

pub use websocket::{parse_route, Route, WsServer};

use tokio::net::TcpStream;

/// Configure an accepted TCP stream
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    // Frames are small and latency matters more than batching
    stream.set_nodelay(true)?;
    Ok(())
}
