//! Device Liveness Tracker
//!
//! Keeps the most recently received status of every device together with the
//! gateway-side instant it arrived. A sweep pings all devices, waits out a
//! grace period, and replaces every status that was not refreshed in time
//! with a synthetic offline status.
//!
//! Freshness is judged on the monotonic receipt instant only; the timestamp
//! inside a payload comes from the device clock and is not trusted here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rumqttc::QoS;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LivenessConfig;
use crate::ingress::MessageBus;
use crate::models::{probe_timeout_status, GatewayPing};

/// Topic devices listen on for liveness probes
pub const PING_TOPIC: &str = "gateway/ping";

/// A status as last received
#[derive(Debug, Clone)]
struct CachedStatus {
    payload: Value,
    received_at: Instant,
    /// Set only when a sweep replaced the device's own report
    synthetic: bool,
}

/// Result of a sweep request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was still running; nothing was done
    AlreadyRunning,
    /// Sweep finished; these devices were marked offline
    Completed { offline: Vec<String> },
}

/// Clears the in-flight flag when a sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Current-status cache with probe and sweep
pub struct LivenessTracker {
    gateway_id: String,
    grace: Duration,
    stale_after: Duration,
    statuses: DashMap<String, CachedStatus>,
    in_flight: AtomicBool,
}

impl LivenessTracker {
    pub fn new(gateway_id: impl Into<String>, config: &LivenessConfig) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            grace: config.grace,
            stale_after: config.stale_after,
            statuses: DashMap::new(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Store a received status, replacing whatever was there
    pub fn record(&self, device_id: &str, payload: Value) {
        self.statuses.insert(
            device_id.to_string(),
            CachedStatus {
                payload,
                received_at: Instant::now(),
                synthetic: false,
            },
        );
    }

    /// Last received (or synthetic) status of a device
    pub fn current(&self, device_id: &str) -> Option<Value> {
        self.statuses.get(device_id).map(|entry| entry.payload.clone())
    }

    /// Number of devices with a cached status
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Whether a sweep is in progress
    pub fn sweep_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Ping every device, wait out the grace period, then mark devices that
    /// did not report since the ping (less `stale_after`) as offline.
    pub async fn sweep(&self, bus: &dyn MessageBus) -> SweepOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Liveness sweep already running, skipping");
            return SweepOutcome::AlreadyRunning;
        }
        let _guard = SweepGuard(&self.in_flight);

        let started = Instant::now();
        self.probe(bus);

        tokio::time::sleep(self.grace).await;

        let offline = match started.checked_sub(self.stale_after) {
            Some(cutoff) => self.mark_stale(cutoff),
            None => Vec::new(),
        };

        if !offline.is_empty() {
            info!("{} device(s) did not answer the ping", offline.len());
        }
        SweepOutcome::Completed { offline }
    }

    fn probe(&self, bus: &dyn MessageBus) {
        let ping = GatewayPing::new(&self.gateway_id);
        let payload = match serde_json::to_value(&ping) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode ping: {}", e);
                return;
            }
        };
        match bus.publish(PING_TOPIC, &payload, QoS::AtLeastOnce, false) {
            Ok(()) => debug!("Sent liveness ping {}", ping.request_id),
            Err(e) => warn!("Liveness ping not sent: {}", e),
        }
    }

    fn mark_stale(&self, cutoff: Instant) -> Vec<String> {
        let now = Utc::now();
        let mut offline = Vec::new();
        for mut entry in self.statuses.iter_mut() {
            if entry.received_at < cutoff && !entry.synthetic {
                warn!("Device {} missed the liveness ping", entry.key());
                entry.payload = probe_timeout_status(entry.key(), now);
                entry.synthetic = true;
                offline.push(entry.key().clone());
            }
        }
        offline.sort();
        offline
    }
}
