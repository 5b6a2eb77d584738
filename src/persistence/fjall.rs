//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Keys are `device_id`, a NUL separator, then the record timestamp encoded
//! so that byte order equals time order. The newest record of a device is the
//! last key under its prefix; a history window is a range scan.
//!
//! Status keys carry a trailing sequence number so reports sharing a
//! timestamp are all kept.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::DeviceStore;
use super::error::{PersistenceError, Result};
use super::models::{StoredStatus, StoredTelemetry};
use crate::models::{DeviceStatusRecord, TelemetryRecord};

/// Fjall-based storage backend
pub struct FjallBackend {
    keyspace: Keyspace,
    telemetry: PartitionHandle,
    status: PartitionHandle,
    status_seq: AtomicU64,
}

/// Key prefix shared by every record of a device
fn device_prefix(device_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(device_id.len() + 1);
    key.extend_from_slice(device_id.as_bytes());
    key.push(0);
    key
}

/// First key past every record of a device
fn device_upper_bound(device_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(device_id.len() + 1);
    key.extend_from_slice(device_id.as_bytes());
    key.push(1);
    key
}

/// Full record key; flipping the sign bit makes big-endian bytes sort like
/// signed milliseconds
fn record_key(device_id: &str, timestamp_millis: i64) -> Vec<u8> {
    let mut key = device_prefix(device_id);
    key.extend_from_slice(&((timestamp_millis as u64) ^ (1 << 63)).to_be_bytes());
    key
}

/// Status key: record key plus an insertion sequence number
fn status_key(device_id: &str, timestamp_millis: i64, seq: u64) -> Vec<u8> {
    let mut key = record_key(device_id, timestamp_millis);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let telemetry = keyspace.open_partition("telemetry", PartitionCreateOptions::default())?;
        let status = keyspace.open_partition("status", PartitionCreateOptions::default())?;

        // Seeded from the clock so sequence numbers keep growing across restarts
        let status_seq = AtomicU64::new(Utc::now().timestamp_micros().max(0) as u64);

        Ok(Self {
            keyspace,
            telemetry,
            status,
            status_seq,
        })
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }
}

#[async_trait]
impl DeviceStore for FjallBackend {
    // ========================================================================
    // Telemetry
    // ========================================================================

    async fn get_latest_telemetry(&self, device_id: &str) -> Result<Option<TelemetryRecord>> {
        match self.telemetry.prefix(device_prefix(device_id)).next_back() {
            Some(item) => {
                let (_, value) = item?;
                let stored: StoredTelemetry = Self::deserialize(&value)?;
                Ok(Some(stored.try_into()?))
            }
            None => Ok(None),
        }
    }

    async fn add_telemetry(&self, record: &TelemetryRecord) -> Result<()> {
        let stored = StoredTelemetry::from(record);
        let bytes = Self::serialize(&stored)?;
        self.telemetry.insert(
            record_key(&record.device_id, stored.timestamp_millis),
            bytes,
        )?;
        Ok(())
    }

    async fn get_telemetry_history(
        &self,
        device_id: &str,
        hours: u32,
    ) -> Result<Vec<TelemetryRecord>> {
        let cutoff = super::history_cutoff(hours);
        let start = record_key(device_id, cutoff.timestamp_millis());
        let end = device_upper_bound(device_id);

        let mut result = Vec::new();
        for item in self.telemetry.range(start..end) {
            let (_, value) = item?;
            let stored: StoredTelemetry = Self::deserialize(&value)?;
            let record: TelemetryRecord = stored.try_into()?;
            if record.timestamp > cutoff {
                result.push(record);
            }
        }
        Ok(result)
    }

    // ========================================================================
    // Status
    // ========================================================================

    async fn get_latest_status(&self, device_id: &str) -> Result<Option<DeviceStatusRecord>> {
        match self.status.prefix(device_prefix(device_id)).next_back() {
            Some(item) => {
                let (_, value) = item?;
                let stored: StoredStatus = Self::deserialize(&value)?;
                Ok(Some(stored.try_into()?))
            }
            None => Ok(None),
        }
    }

    async fn add_status(&self, record: &DeviceStatusRecord) -> Result<()> {
        let stored = StoredStatus::from(record);
        let bytes = Self::serialize(&stored)?;
        let seq = self.status_seq.fetch_add(1, Ordering::Relaxed);
        self.status.insert(
            status_key(&record.device_id, stored.timestamp_millis, seq),
            bytes,
        )?;
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Flush before closing
        self.flush().await?;
        // fjall handles cleanup on drop
        Ok(())
    }
}
