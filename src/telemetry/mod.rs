//! Telemetry Cache
//!
//! Bounded per-device ring buffers in front of the durable store. Writes go
//! to the buffer first and then through to the store; reads of the newest
//! sample fall back to the store when the buffer is empty. History queries
//! always go to the store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::models::TelemetryRecord;
use crate::persistence::{DeviceStore, Result};

pub struct TelemetryCache {
    capacity: usize,
    buffers: Mutex<HashMap<String, VecDeque<TelemetryRecord>>>,
    store: Arc<dyn DeviceStore>,
}

impl TelemetryCache {
    /// Create a cache keeping up to `capacity` samples per device
    pub fn new(capacity: usize, store: Arc<dyn DeviceStore>) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Buffer a sample, then write it through to the store.
    ///
    /// A sample with the same timestamp as a buffered one replaces it. The
    /// buffered value stays visible even when the store write fails.
    pub async fn add(&self, record: TelemetryRecord) -> Result<()> {
        {
            let mut buffers = self.buffers.lock();
            let buffer = buffers
                .entry(record.device_id.clone())
                .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(64)));

            match buffer
                .iter_mut()
                .rev()
                .find(|existing| existing.timestamp == record.timestamp)
            {
                Some(existing) => *existing = record.clone(),
                None => {
                    buffer.push_back(record.clone());
                    while buffer.len() > self.capacity {
                        buffer.pop_front();
                    }
                }
            }
        }

        if let Err(e) = self.store.add_telemetry(&record).await {
            warn!(
                "Telemetry for {} cached but not persisted: {}",
                record.device_id, e
            );
            return Err(e);
        }
        Ok(())
    }

    /// Newest sample for a device
    pub async fn latest(&self, device_id: &str) -> Result<Option<TelemetryRecord>> {
        let buffered = self
            .buffers
            .lock()
            .get(device_id)
            .and_then(|buffer| buffer.back().cloned());
        if buffered.is_some() {
            return Ok(buffered);
        }
        debug!("No buffered telemetry for {}, asking store", device_id);
        self.store.get_latest_telemetry(device_id).await
    }

    /// Samples from the last `hours`, oldest first
    pub async fn history(&self, device_id: &str, hours: u32) -> Result<Vec<TelemetryRecord>> {
        self.store.get_telemetry_history(device_id, hours).await
    }

    /// Snapshot of a device's buffer, oldest first
    pub fn buffered(&self, device_id: &str) -> Vec<TelemetryRecord> {
        self.buffers
            .lock()
            .get(device_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceStatusRecord;
    use crate::persistence::{MemoryStore, PersistenceError};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn sample(device_id: &str, at: DateTime<Utc>, co2: f64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            timestamp: at,
            env_temperature: 23.0,
            humidity: 50.0,
            pressure: 1010.0,
            light: 600.0,
            co2,
            voc: 8.0,
            soil_temperature: 18.0,
            soil_moisture: 35.0,
            soil_ph: 6.8,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    /// Store that is always down
    struct UnavailableStore;

    #[async_trait]
    impl DeviceStore for UnavailableStore {
        async fn get_latest_telemetry(&self, _: &str) -> Result<Option<TelemetryRecord>> {
            Err(PersistenceError::Unavailable("offline".into()))
        }
        async fn add_telemetry(&self, _: &TelemetryRecord) -> Result<()> {
            Err(PersistenceError::Unavailable("offline".into()))
        }
        async fn get_telemetry_history(&self, _: &str, _: u32) -> Result<Vec<TelemetryRecord>> {
            Err(PersistenceError::Unavailable("offline".into()))
        }
        async fn get_latest_status(&self, _: &str) -> Result<Option<DeviceStatusRecord>> {
            Err(PersistenceError::Unavailable("offline".into()))
        }
        async fn add_status(&self, _: &DeviceStatusRecord) -> Result<()> {
            Err(PersistenceError::Unavailable("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest() {
        let store = Arc::new(MemoryStore::new());
        let cache = TelemetryCache::new(3, store.clone());

        for i in 0..5 {
            cache
                .add(sample("d1", base() + Duration::seconds(i), i as f64))
                .await
                .unwrap();
        }

        let buffered: Vec<f64> = cache.buffered("d1").iter().map(|r| r.co2).collect();
        assert_eq!(buffered, vec![2.0, 3.0, 4.0]);
        // Everything still went through to the store
        assert_eq!(store.telemetry_count("d1"), 5);
    }

    #[tokio::test]
    async fn test_same_timestamp_replaces() {
        let store = Arc::new(MemoryStore::new());
        let cache = TelemetryCache::new(10, store.clone());

        cache.add(sample("d1", base(), 400.0)).await.unwrap();
        cache.add(sample("d1", base(), 405.0)).await.unwrap();

        let buffered = cache.buffered("d1");
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].co2, 405.0);
        assert_eq!(store.telemetry_count("d1"), 1);
    }

    #[tokio::test]
    async fn test_latest_prefers_buffer_then_store() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_telemetry(&sample("d2", base(), 380.0))
            .await
            .unwrap();
        let cache = TelemetryCache::new(10, store);

        // Nothing buffered for d2 yet, so the store answers
        assert_eq!(cache.latest("d2").await.unwrap().unwrap().co2, 380.0);

        cache
            .add(sample("d2", base() + Duration::minutes(1), 390.0))
            .await
            .unwrap();
        assert_eq!(cache.latest("d2").await.unwrap().unwrap().co2, 390.0);
        assert!(cache.latest("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_but_keeps_buffer() {
        let cache = TelemetryCache::new(10, Arc::new(UnavailableStore));

        let result = cache.add(sample("d3", base(), 415.0)).await;
        assert!(matches!(result, Err(PersistenceError::Unavailable(_))));

        // Served from the buffer without touching the store
        assert_eq!(cache.latest("d3").await.unwrap().unwrap().co2, 415.0);
        assert!(cache.history("d3", 24).await.is_err());
    }

    #[tokio::test]
    async fn test_history_comes_from_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = TelemetryCache::new(1, store);
        let now = Utc::now();

        cache
            .add(sample("d4", now - Duration::hours(2), 1.0))
            .await
            .unwrap();
        cache.add(sample("d4", now, 2.0)).await.unwrap();

        assert_eq!(cache.buffered("d4").len(), 1);
        let history = cache.history("d4", 24).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].co2, 1.0);
    }
}
