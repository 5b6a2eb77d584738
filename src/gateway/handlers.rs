//! Inbound message handlers
//!
//! One handler per device topic family. Each holds only the components it
//! touches.

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::fanout::ConnectionManager;
use crate::ingress::MessageBus;
use crate::liveness::LivenessTracker;
use crate::models::{
    device_id_for, DecodeError, DeviceStatusRecord, DiscoveryResponse, TelemetryRecord,
};
use crate::persistence::DeviceStore;
use crate::registry::{HandlerError, MessageHandler};
use crate::telemetry::TelemetryCache;

pub const TELEMETRY_PATTERN: &str = "devices/+/telemetry";
pub const STATUS_PATTERN: &str = "devices/+/status";
pub const ALERTS_PATTERN: &str = "devices/+/alerts";
pub const DISCOVERY_TOPIC: &str = "devices/discovery/announce";

/// Caches, persists and forwards telemetry samples
pub struct TelemetryHandler {
    pub(super) cache: Arc<TelemetryCache>,
    pub(super) connections: Arc<ConnectionManager>,
}

#[async_trait]
impl MessageHandler for TelemetryHandler {
    async fn handle(&self, topic: &str, payload: &Value) -> Result<(), HandlerError> {
        let record = TelemetryRecord::from_payload(topic, payload)?;
        let device_id = record.device_id.clone();

        // A store outage must not hold back live subscribers
        let stored = self.cache.add(record).await;

        let delivered = self.connections.broadcast_telemetry(&device_id, payload);
        debug!("Telemetry from {} sent to {} client(s)", device_id, delivered);

        stored.map_err(HandlerError::from)
    }
}

/// Tracks liveness, persists and forwards status reports
pub struct StatusHandler {
    pub(super) liveness: Arc<LivenessTracker>,
    pub(super) store: Arc<dyn DeviceStore>,
    pub(super) connections: Arc<ConnectionManager>,
}

#[async_trait]
impl MessageHandler for StatusHandler {
    async fn handle(&self, topic: &str, payload: &Value) -> Result<(), HandlerError> {
        let device_id = device_id_for(topic, payload)?;

        // Any report counts as a sign of life, even one we cannot decode
        self.liveness.record(&device_id, payload.clone());

        let record = DeviceStatusRecord::from_payload(topic, payload)?;
        if record.error_code != 0 {
            warn!(
                "Device {} reports {} (error {}: {})",
                device_id, record.status, record.error_code, record.error_message
            );
        }

        let stored = self.store.add_status(&record).await;
        self.connections.broadcast_status(&device_id, payload);

        stored.map_err(HandlerError::from)
    }
}

/// Logs device alerts
pub struct AlertHandler;

#[async_trait]
impl MessageHandler for AlertHandler {
    async fn handle(&self, topic: &str, payload: &Value) -> Result<(), HandlerError> {
        let device_id = device_id_for(topic, payload)?;
        let alert_type = payload
            .get("alert_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let severity = payload
            .get("severity")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        warn!("Alert from {}: {} ({})", device_id, alert_type, severity);
        Ok(())
    }
}

/// Answers discovery announcements
pub struct DiscoveryHandler {
    pub(super) gateway_id: String,
    pub(super) ntp_server: String,
    pub(super) qos: QoS,
    pub(super) bus: Arc<dyn MessageBus>,
}

#[async_trait]
impl MessageHandler for DiscoveryHandler {
    async fn handle(&self, _topic: &str, payload: &Value) -> Result<(), HandlerError> {
        let device_id = payload
            .get("device_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(DecodeError::MissingDeviceId)?;
        let device_type = payload
            .get("device_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        crate::topic::validate_device_id(device_id)
            .map_err(|reason| DecodeError::Schema(format!("device_id: {}", reason)))?;

        info!("Device discovery: {} ({})", device_id, device_type);

        let response = DiscoveryResponse::accept(device_id, &self.gateway_id, &self.ntp_server);
        let body = serde_json::to_value(&response).map_err(DecodeError::from)?;
        self.bus.publish(
            &format!("devices/discovery/response/{}", device_id),
            &body,
            self.qos,
            false,
        )?;
        Ok(())
    }
}
