//! Persistence module for Fieldlink.
//!
//! Provides durable storage for:
//! - Telemetry history (queried by time window)
//! - Device status history (newest entry is the last known status)
//!
//! Uses a trait-based design allowing different backends:
//! - `FjallBackend` (default) - Local LSM-tree storage
//! - `MemoryStore` - volatile, for persistence-disabled runs and tests

mod backend;
mod error;
mod fjall;
mod memory;
mod models;

pub use backend::DeviceStore;
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryStore;
pub use models::{StoredStatus, StoredTelemetry};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::config::PersistenceConfig;

/// Oldest timestamp inside a history window of `hours`; windows reaching
/// past the representable range cover all history
pub(crate) fn history_cutoff(hours: u32) -> DateTime<Utc> {
    Duration::try_hours(i64::from(hours))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Open the store selected by configuration
pub fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn DeviceStore>> {
    if config.enabled {
        info!("Opening fjall store at {:?}", config.path);
        Ok(Arc::new(FjallBackend::open(&config.path)?))
    } else {
        info!("Persistence disabled, history is kept in memory only");
        Ok(Arc::new(MemoryStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceStatus, DeviceStatusRecord, TelemetryRecord};
    use pretty_assertions::assert_eq;

    fn telemetry(device_id: &str, hours_ago: i64, co2: f64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            timestamp: Utc::now() - Duration::hours(hours_ago),
            env_temperature: 22.0,
            humidity: 55.0,
            pressure: 1013.0,
            light: 700.0,
            co2,
            voc: 10.0,
            soil_temperature: 19.0,
            soil_moisture: 40.0,
            soil_ph: 6.5,
        }
    }

    fn status(device_id: &str, state: DeviceStatus) -> DeviceStatusRecord {
        DeviceStatusRecord {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            status: state,
            firmware_version: "1.2.0".to_string(),
            uptime_seconds: 3600,
            signal_strength: -58,
            error_code: 0,
            error_message: String::new(),
            free_memory: Some(81_920),
            internal_temperature: 38.5,
            internal_humidity: 30.0,
            battery_level: None,
        }
    }

    async fn exercise_store(store: &dyn DeviceStore) {
        assert!(store.get_latest_telemetry("d1").await.unwrap().is_none());

        let old = telemetry("d1", 30, 400.0);
        let recent = telemetry("d1", 2, 420.0);
        let newest = telemetry("d1", 0, 430.0);
        for record in [&recent, &old, &newest] {
            store.add_telemetry(record).await.unwrap();
        }
        store.add_telemetry(&telemetry("d10", 0, 999.0)).await.unwrap();

        let latest = store.get_latest_telemetry("d1").await.unwrap().unwrap();
        assert_eq!(latest.co2, 430.0);

        let everything = store.get_telemetry_history("d1", u32::MAX).await.unwrap();
        assert_eq!(everything.len(), 3);
        assert_eq!(everything[0].co2, 400.0);

        let history = store.get_telemetry_history("d1", 24).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].co2, 420.0);
        assert_eq!(history[1].co2, 430.0);

        // Same key, later write wins
        let mut replacement = newest.clone();
        replacement.co2 = 431.0;
        store.add_telemetry(&replacement).await.unwrap();
        let latest = store.get_latest_telemetry("d1").await.unwrap().unwrap();
        assert_eq!(latest.co2, 431.0);
        assert_eq!(store.get_telemetry_history("d1", 24).await.unwrap().len(), 2);

        store
            .add_status(&status("d1", DeviceStatus::Online))
            .await
            .unwrap();
        let current = store.get_latest_status("d1").await.unwrap().unwrap();
        assert_eq!(current.status, DeviceStatus::Online);
        assert_eq!(current.free_memory, Some(81_920));
        assert!(store.get_latest_status("d2").await.unwrap().is_none());
    }

    #[test]
    fn test_history_cutoff() {
        let day = history_cutoff(24);
        let expected = Utc::now() - Duration::hours(24);
        assert!((expected - day).num_seconds().abs() <= 1);
        assert_eq!(history_cutoff(u32::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_fjall_backend_basic_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();
        exercise_store(&backend).await;
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryStore::new();
        exercise_store(&store).await;
        assert_eq!(store.telemetry_count("d1"), 3);
        assert_eq!(store.status_count("d1"), 1);
    }

    #[tokio::test]
    async fn test_fjall_backend_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let backend = FjallBackend::open(temp_dir.path()).unwrap();
            backend.add_telemetry(&telemetry("d1", 1, 415.0)).await.unwrap();
            backend.close().await.unwrap();
        }

        let backend = FjallBackend::open(temp_dir.path()).unwrap();
        let latest = backend.get_latest_telemetry("d1").await.unwrap().unwrap();
        assert_eq!(latest.co2, 415.0);
    }
}
