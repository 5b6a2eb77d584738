//! Connection Fan-out Manager
//!
//! Tracks which clients listen to which device and pushes data to them.
//!
//! - Telemetry: any number of subscribers per device.
//! - Video: at most one subscriber per device; a newcomer evicts the old one.
//!
//! Broadcasts attempt every subscriber first and prune the failed ones
//! afterwards, so one bad client never costs the others their frame.

mod connection;

pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionKind, LiveConnection, OutboundFrame, SendError,
};

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Owner of every registered client connection
#[derive(Default)]
pub struct ConnectionManager {
    telemetry: RwLock<HashMap<String, HashMap<ConnectionId, LiveConnection>>>,
    video: RwLock<HashMap<String, LiveConnection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Telemetry track
    // ========================================================================

    pub fn add_telemetry_subscriber(&self, conn: LiveConnection) {
        let device_id = conn.device_id().to_string();
        let count = {
            let mut telemetry = self.telemetry.write();
            let subscribers = telemetry.entry(device_id.clone()).or_default();
            subscribers.insert(conn.id(), conn);
            subscribers.len()
        };
        info!(
            "Telemetry client connected for {} ({} total)",
            device_id, count
        );
    }

    /// Returns the removed connection, if it was registered
    pub fn remove_telemetry_subscriber(
        &self,
        device_id: &str,
        id: ConnectionId,
    ) -> Option<LiveConnection> {
        let mut telemetry = self.telemetry.write();
        let subscribers = telemetry.get_mut(device_id)?;
        let removed = subscribers.remove(&id);
        if subscribers.is_empty() {
            telemetry.remove(device_id);
        }
        if removed.is_some() {
            debug!("Telemetry client {} removed for {}", id, device_id);
        }
        removed
    }

    /// Send `data` to every telemetry subscriber of a device. Returns the
    /// number of successful deliveries; failed subscribers are dropped.
    pub fn broadcast_telemetry(&self, device_id: &str, data: &Value) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let telemetry = self.telemetry.read();
            let Some(subscribers) = telemetry.get(device_id) else {
                return 0;
            };
            for (id, conn) in subscribers {
                match conn.try_send(OutboundFrame::Json(data.clone())) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("Telemetry send to {} for {} failed: {}", id, device_id, e);
                        failed.push(*id);
                    }
                }
            }
        }

        for id in failed {
            if let Some(conn) = self.remove_telemetry_subscriber(device_id, id) {
                conn.close();
            }
        }
        delivered
    }

    /// Wrap a status in the client envelope and send it on the telemetry track
    pub fn broadcast_status(&self, device_id: &str, status: &Value) -> usize {
        let envelope = json!({
            "type": "status",
            "device_id": device_id,
            "data": status,
        });
        self.broadcast_telemetry(device_id, &envelope)
    }

    pub fn telemetry_subscriber_count(&self, device_id: &str) -> usize {
        self.telemetry
            .read()
            .get(device_id)
            .map_or(0, HashMap::len)
    }

    /// Devices with at least one telemetry subscriber
    pub fn watched_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.telemetry.read().keys().cloned().collect();
        devices.sort();
        devices
    }

    // ========================================================================
    // Video track
    // ========================================================================

    /// Install the video subscriber for a device, closing any previous one.
    /// Returns the evicted connection.
    pub fn add_video_subscriber(&self, conn: LiveConnection) -> Option<LiveConnection> {
        let device_id = conn.device_id().to_string();
        let displaced = {
            let mut video = self.video.write();
            if let Some(old) = video.remove(&device_id) {
                old.close();
                video.insert(device_id.clone(), conn);
                Some(old)
            } else {
                video.insert(device_id.clone(), conn);
                None
            }
        };
        match &displaced {
            Some(old) => info!("Video client {} for {} replaced", old.id(), device_id),
            None => info!("Video client connected for {}", device_id),
        }
        displaced
    }

    /// Empty the video slot, but only if it still holds `id`
    pub fn remove_video_subscriber(&self, device_id: &str, id: ConnectionId) -> bool {
        let mut video = self.video.write();
        match video.get(device_id) {
            Some(conn) if conn.id() == id => {
                video.remove(device_id);
                debug!("Video client {} removed for {}", id, device_id);
                true
            }
            _ => false,
        }
    }

    /// Send one binary frame to the device's video subscriber
    pub fn relay_video_frame(&self, device_id: &str, frame: Bytes) -> bool {
        let result = {
            let video = self.video.read();
            let Some(conn) = video.get(device_id) else {
                return false;
            };
            conn.try_send(OutboundFrame::Binary(frame))
                .map_err(|e| (conn.id(), e))
        };

        match result {
            Ok(()) => true,
            Err((id, e)) => {
                warn!("Video send to {} for {} failed: {}", id, device_id, e);
                let stale = {
                    let mut video = self.video.write();
                    match video.get(device_id) {
                        Some(conn) if conn.id() == id => video.remove(device_id),
                        _ => None,
                    }
                };
                if let Some(conn) = stale {
                    conn.close();
                }
                false
            }
        }
    }

    pub fn video_subscriber(&self, device_id: &str) -> Option<ConnectionId> {
        self.video.read().get(device_id).map(LiveConnection::id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close and forget every connection
    pub fn close_all(&self) {
        let telemetry: Vec<LiveConnection> = self
            .telemetry
            .write()
            .drain()
            .flat_map(|(_, subscribers)| subscribers.into_values())
            .collect();
        let video: Vec<LiveConnection> = self.video.write().drain().map(|(_, c)| c).collect();

        for conn in telemetry.iter().chain(video.iter()) {
            conn.close();
        }
    }
}
