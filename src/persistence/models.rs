//! Serializable data models for persistence.
//!
//! These are storage-friendly versions of the device records that can be
//! serialized with bincode.

use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};

use super::error::PersistenceError;
use crate::models::{DeviceStatus, DeviceStatusRecord, TelemetryRecord};

/// Stored telemetry sample
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredTelemetry {
    pub device_id: String,
    /// Unix timestamp in milliseconds
    pub timestamp_millis: i64,
    pub env_temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub light: f64,
    pub co2: f64,
    pub voc: f64,
    pub soil_temperature: f64,
    pub soil_moisture: f64,
    pub soil_ph: f64,
}

/// Stored status report
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredStatus {
    pub device_id: String,
    /// Unix timestamp in milliseconds
    pub timestamp_millis: i64,
    /// 0 = online, 1 = offline, 2 = error, 3 = maintenance
    pub status: u8,
    pub firmware_version: String,
    pub uptime_seconds: u64,
    pub signal_strength: i64,
    pub error_code: i64,
    pub error_message: String,
    pub free_memory: Option<u64>,
    pub internal_temperature: f64,
    pub internal_humidity: f64,
    pub battery_level: Option<u8>,
}

// ============================================================================
// Conversion implementations
// ============================================================================

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| PersistenceError::Corruption(format!("timestamp out of range: {}", millis)))
}

fn status_to_u8(status: DeviceStatus) -> u8 {
    match status {
        DeviceStatus::Online => 0,
        DeviceStatus::Offline => 1,
        DeviceStatus::Error => 2,
        DeviceStatus::Maintenance => 3,
    }
}

fn u8_to_status(value: u8) -> Result<DeviceStatus, PersistenceError> {
    match value {
        0 => Ok(DeviceStatus::Online),
        1 => Ok(DeviceStatus::Offline),
        2 => Ok(DeviceStatus::Error),
        3 => Ok(DeviceStatus::Maintenance),
        other => Err(PersistenceError::Corruption(format!(
            "unknown status code: {}",
            other
        ))),
    }
}

impl From<&TelemetryRecord> for StoredTelemetry {
    fn from(record: &TelemetryRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            timestamp_millis: record.timestamp.timestamp_millis(),
            env_temperature: record.env_temperature,
            humidity: record.humidity,
            pressure: record.pressure,
            light: record.light,
            co2: record.co2,
            voc: record.voc,
            soil_temperature: record.soil_temperature,
            soil_moisture: record.soil_moisture,
            soil_ph: record.soil_ph,
        }
    }
}

impl TryFrom<StoredTelemetry> for TelemetryRecord {
    type Error = PersistenceError;

    fn try_from(stored: StoredTelemetry) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: millis_to_datetime(stored.timestamp_millis)?,
            device_id: stored.device_id,
            env_temperature: stored.env_temperature,
            humidity: stored.humidity,
            pressure: stored.pressure,
            light: stored.light,
            co2: stored.co2,
            voc: stored.voc,
            soil_temperature: stored.soil_temperature,
            soil_moisture: stored.soil_moisture,
            soil_ph: stored.soil_ph,
        })
    }
}

impl From<&DeviceStatusRecord> for StoredStatus {
    fn from(record: &DeviceStatusRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            timestamp_millis: record.timestamp.timestamp_millis(),
            status: status_to_u8(record.status),
            firmware_version: record.firmware_version.clone(),
            uptime_seconds: record.uptime_seconds,
            signal_strength: record.signal_strength,
            error_code: record.error_code,
            error_message: record.error_message.clone(),
            free_memory: record.free_memory,
            internal_temperature: record.internal_temperature,
            internal_humidity: record.internal_humidity,
            battery_level: record.battery_level,
        }
    }
}

impl TryFrom<StoredStatus> for DeviceStatusRecord {
    type Error = PersistenceError;

    fn try_from(stored: StoredStatus) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: millis_to_datetime(stored.timestamp_millis)?,
            status: u8_to_status(stored.status)?,
            device_id: stored.device_id,
            firmware_version: stored.firmware_version,
            uptime_seconds: stored.uptime_seconds,
            signal_strength: stored.signal_strength,
            error_code: stored.error_code,
            error_message: stored.error_message,
            free_memory: stored.free_memory,
            internal_temperature: stored.internal_temperature,
            internal_humidity: stored.internal_humidity,
            battery_level: stored.battery_level,
        })
    }
}
