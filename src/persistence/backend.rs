//! Storage backend trait for persistence.
//!
//! The durable store is an external collaborator reached through simple
//! CRUD-style calls. Any of them may fail; callers fall back to cache-only
//! behaviour where they can.

use async_trait::async_trait;

use super::error::Result;
use crate::models::{DeviceStatusRecord, TelemetryRecord};

/// Storage backend trait for device history
#[async_trait]
pub trait DeviceStore: Send + Sync {
    // ========================================================================
    // Telemetry
    // ========================================================================

    /// Get the newest telemetry record for a device
    async fn get_latest_telemetry(&self, device_id: &str) -> Result<Option<TelemetryRecord>>;

    /// Store a telemetry record. A record with the same device and timestamp
    /// replaces the earlier one.
    async fn add_telemetry(&self, record: &TelemetryRecord) -> Result<()>;

    /// Telemetry newer than `hours` ago, oldest first
    async fn get_telemetry_history(
        &self,
        device_id: &str,
        hours: u32,
    ) -> Result<Vec<TelemetryRecord>>;

    // ========================================================================
    // Status
    // ========================================================================

    /// Get the newest status record for a device
    async fn get_latest_status(&self, device_id: &str) -> Result<Option<DeviceStatusRecord>>;

    /// Append a status record to the device's history
    async fn add_status(&self, record: &DeviceStatusRecord) -> Result<()>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Close the backend (flush and release resources)
    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}
