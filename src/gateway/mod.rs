//! Gateway
//!
//! Wires the components together and exposes the operations the request
//! layer needs: device commands and configuration, client registration,
//! broadcasts, and cached reads. All components are created once and shared
//! through `Arc`s; nothing here is global.

mod handlers;

pub use handlers::{
    AlertHandler, DiscoveryHandler, StatusHandler, TelemetryHandler, ALERTS_PATTERN,
    DISCOVERY_TOPIC, STATUS_PATTERN, TELEMETRY_PATTERN,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::QoS;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fanout::{
    ConnectionHandle, ConnectionId, ConnectionKind, ConnectionManager, LiveConnection,
};
use crate::ingress::{IngressError, MessageBus};
use crate::liveness::{LivenessTracker, SweepOutcome};
use crate::models::{ConfigUpdate, DeviceCommand, TelemetryRecord};
use crate::persistence::{self, DeviceStore, PersistenceError};
use crate::registry::{MessageHandler, SubscriptionRegistry};
use crate::telemetry::TelemetryCache;
use crate::topic;

/// Shared gateway state
pub struct Gateway {
    gateway_id: String,
    ntp_server: String,
    qos: QoS,
    liveness_interval: Duration,
    outbound_capacity: usize,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn DeviceStore>,
    registry: Arc<SubscriptionRegistry>,
    telemetry: Arc<TelemetryCache>,
    liveness: Arc<LivenessTracker>,
    connections: Arc<ConnectionManager>,
}

impl Gateway {
    pub fn new(config: &Config, bus: Arc<dyn MessageBus>, store: Arc<dyn DeviceStore>) -> Self {
        Self {
            gateway_id: config.gateway.id.clone(),
            ntp_server: config.gateway.ntp_server.clone(),
            qos: config.mqtt.qos_level(),
            liveness_interval: config.liveness.interval,
            outbound_capacity: config.server.outbound_channel_capacity,
            telemetry: Arc::new(TelemetryCache::new(
                config.telemetry.buffer_size,
                Arc::clone(&store),
            )),
            liveness: Arc::new(LivenessTracker::new(
                config.gateway.id.clone(),
                &config.liveness,
            )),
            registry: Arc::new(SubscriptionRegistry::new()),
            connections: Arc::new(ConnectionManager::new()),
            bus,
            store,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }

    pub fn telemetry_cache(&self) -> &Arc<TelemetryCache> {
        &self.telemetry
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register a handler and make sure the broker delivers its pattern
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn MessageHandler>) {
        if self.registry.subscribe(pattern, handler) {
            if let Err(e) = self.bus.subscribe_remote(pattern) {
                warn!("Failed to subscribe to {}: {}", pattern, e);
            }
        }
    }

    /// Register the built-in device topic handlers
    pub fn install_handlers(&self) {
        self.subscribe(
            TELEMETRY_PATTERN,
            Arc::new(TelemetryHandler {
                cache: Arc::clone(&self.telemetry),
                connections: Arc::clone(&self.connections),
            }),
        );
        self.subscribe(
            STATUS_PATTERN,
            Arc::new(StatusHandler {
                liveness: Arc::clone(&self.liveness),
                store: Arc::clone(&self.store),
                connections: Arc::clone(&self.connections),
            }),
        );
        self.subscribe(ALERTS_PATTERN, Arc::new(AlertHandler));
        self.subscribe(
            DISCOVERY_TOPIC,
            Arc::new(DiscoveryHandler {
                gateway_id: self.gateway_id.clone(),
                ntp_server: self.ntp_server.clone(),
                qos: self.qos,
                bus: Arc::clone(&self.bus),
            }),
        );
        info!("Device handlers installed");
    }

    // ========================================================================
    // Device control
    // ========================================================================

    /// Publish a command on `devices/{id}/commands`
    pub fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), IngressError> {
        check_device_id(device_id)?;
        let topic = format!("devices/{}/commands", device_id);
        let payload = command.to_payload(Utc::now());
        self.bus
            .publish(&topic, &payload, QoS::AtLeastOnce, false)?;
        info!("Sent command '{}' to {}", command.command, device_id);
        Ok(())
    }

    /// Publish a retained configuration update on `devices/{id}/config`.
    /// An update with no fields set publishes nothing.
    pub fn update_config(
        &self,
        device_id: &str,
        update: &ConfigUpdate,
    ) -> Result<(), IngressError> {
        check_device_id(device_id)?;
        if update.is_empty() {
            debug!("Empty config update for {}, nothing to send", device_id);
            return Ok(());
        }
        let topic = format!("devices/{}/config", device_id);
        let payload = update.to_payload(Utc::now());
        self.bus.publish(&topic, &payload, QoS::AtLeastOnce, true)?;
        info!("Sent config update to {}", device_id);
        Ok(())
    }

    // ========================================================================
    // Client registration
    // ========================================================================

    pub fn register_telemetry_client(
        &self,
        device_id: &str,
    ) -> (LiveConnection, ConnectionHandle) {
        let (conn, handle) =
            LiveConnection::new(device_id, ConnectionKind::Telemetry, self.outbound_capacity);
        self.connections.add_telemetry_subscriber(conn.clone());
        (conn, handle)
    }

    pub fn unregister_telemetry_client(&self, device_id: &str, id: ConnectionId) {
        if let Some(conn) = self.connections.remove_telemetry_subscriber(device_id, id) {
            conn.close();
        }
    }

    /// Take over the device's video slot and ask the device to stream
    pub fn register_video_client(
        &self,
        device_id: &str,
    ) -> (LiveConnection, ConnectionHandle) {
        let (conn, handle) =
            LiveConnection::new(device_id, ConnectionKind::Video, self.outbound_capacity);
        self.connections.add_video_subscriber(conn.clone());

        let start = DeviceCommand::new("start_stream")
            .with_parameter("quality", "high")
            .with_parameter("fps", 30);
        if let Err(e) = self.send_command(device_id, &start) {
            warn!("Failed to ask {} to start streaming: {}", device_id, e);
        }
        (conn, handle)
    }

    /// Release the video slot if `id` still holds it and stop the stream
    pub fn unregister_video_client(&self, device_id: &str, id: ConnectionId) {
        if !self.connections.remove_video_subscriber(device_id, id) {
            // Replaced by a newer client which keeps the stream running
            return;
        }
        if let Err(e) = self.send_command(device_id, &DeviceCommand::new("stop_stream")) {
            warn!("Failed to ask {} to stop streaming: {}", device_id, e);
        }
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    pub fn broadcast_telemetry(&self, device_id: &str, data: &Value) -> usize {
        self.connections.broadcast_telemetry(device_id, data)
    }

    pub fn broadcast_status(&self, device_id: &str, status: &Value) -> usize {
        self.connections.broadcast_status(device_id, status)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn latest_telemetry(
        &self,
        device_id: &str,
    ) -> persistence::Result<Option<TelemetryRecord>> {
        self.telemetry.latest(device_id).await
    }

    pub async fn telemetry_history(
        &self,
        device_id: &str,
        hours: u32,
    ) -> persistence::Result<Vec<TelemetryRecord>> {
        self.telemetry.history(device_id, hours).await
    }

    /// Cached status if the device reported since startup, else the newest
    /// stored one
    pub async fn current_status(&self, device_id: &str) -> persistence::Result<Option<Value>> {
        if let Some(status) = self.liveness.current(device_id) {
            return Ok(Some(status));
        }
        match self.store.get_latest_status(device_id).await? {
            Some(record) => serde_json::to_value(&record)
                .map(Some)
                .map_err(|e| PersistenceError::Serialize(e.to_string())),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Run one sweep and push the resulting offline statuses to subscribers
    pub async fn run_liveness_sweep(&self) -> SweepOutcome {
        let outcome = self.liveness.sweep(self.bus.as_ref()).await;
        if let SweepOutcome::Completed { offline } = &outcome {
            for device_id in offline {
                if let Some(status) = self.liveness.current(device_id) {
                    self.connections.broadcast_status(device_id, &status);
                }
            }
        }
        outcome
    }

    /// Sweep every `liveness.interval` until cancelled
    pub fn spawn_liveness_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.liveness_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; devices get a full
            // interval to report before the first probe
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = gateway.run_liveness_sweep() => {
                        debug!("Liveness sweep finished: {:?}", outcome);
                    }
                }
            }
            debug!("Liveness sweeper stopped");
        })
    }
}

fn check_device_id(device_id: &str) -> Result<(), IngressError> {
    topic::validate_device_id(device_id).map_err(|reason| {
        IngressError::InvalidTopic(format!("device '{}': {}", device_id, reason))
    })
}
