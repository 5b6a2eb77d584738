//! In-process storage backend.
//!
//! Used when durable persistence is disabled and as the default store in
//! tests. Follows the same key semantics as the fjall backend: one telemetry
//! record per (device, timestamp), every status report kept, ordered by time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::backend::DeviceStore;
use super::error::Result;
use crate::models::{DeviceStatusRecord, TelemetryRecord};

type History<K, T> = HashMap<String, BTreeMap<K, T>>;

/// Volatile store backed by ordered maps
#[derive(Default)]
pub struct MemoryStore {
    telemetry: RwLock<History<DateTime<Utc>, TelemetryRecord>>,
    status: RwLock<History<(DateTime<Utc>, u64), DeviceStatusRecord>>,
    status_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of telemetry records held for a device
    pub fn telemetry_count(&self, device_id: &str) -> usize {
        self.telemetry
            .read()
            .get(device_id)
            .map_or(0, BTreeMap::len)
    }

    /// Number of status records held for a device
    pub fn status_count(&self, device_id: &str) -> usize {
        self.status.read().get(device_id).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_latest_telemetry(&self, device_id: &str) -> Result<Option<TelemetryRecord>> {
        Ok(self
            .telemetry
            .read()
            .get(device_id)
            .and_then(|history| history.values().next_back().cloned()))
    }

    async fn add_telemetry(&self, record: &TelemetryRecord) -> Result<()> {
        self.telemetry
            .write()
            .entry(record.device_id.clone())
            .or_default()
            .insert(record.timestamp, record.clone());
        Ok(())
    }

    async fn get_telemetry_history(
        &self,
        device_id: &str,
        hours: u32,
    ) -> Result<Vec<TelemetryRecord>> {
        let cutoff = super::history_cutoff(hours);
        Ok(self
            .telemetry
            .read()
            .get(device_id)
            .map(|history| {
                history
                    .range(cutoff..)
                    .filter(|(ts, _)| **ts > cutoff)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_latest_status(&self, device_id: &str) -> Result<Option<DeviceStatusRecord>> {
        Ok(self
            .status
            .read()
            .get(device_id)
            .and_then(|history| history.values().next_back().cloned()))
    }

    async fn add_status(&self, record: &DeviceStatusRecord) -> Result<()> {
        let seq = self.status_seq.fetch_add(1, Ordering::Relaxed);
        self.status
            .write()
            .entry(record.device_id.clone())
            .or_default()
            .insert((record.timestamp, seq), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_status_reports_with_same_timestamp_are_all_kept() {
        let store = MemoryStore::new();
        for state in ["online", "maintenance"] {
            let record = DeviceStatusRecord::from_payload(
                "devices/d1/status",
                &json!({"status": state, "timestamp": "2024-05-01T12:00:00Z"}),
            )
            .unwrap();
            store.add_status(&record).await.unwrap();
        }

        assert_eq!(store.status_count("d1"), 2);
        let latest = store.get_latest_status("d1").await.unwrap().unwrap();
        assert_eq!(latest.status, DeviceStatus::Maintenance);
    }
}
