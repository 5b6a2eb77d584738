//! Device records and outbound message bodies
//!
//! Records are decoded from the JSON payloads devices publish and are never
//! mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Error code carried by the synthetic status of a device that missed a
/// liveness probe
pub const PROBE_TIMEOUT_ERROR_CODE: i64 = 99;

/// Error message carried by the synthetic status of a device that missed a
/// liveness probe
pub const PROBE_TIMEOUT_ERROR_MESSAGE: &str = "No response to gateway ping";

/// Errors while turning a payload into a record
#[derive(Debug)]
pub enum DecodeError {
    /// Neither the payload nor the topic names a device
    MissingDeviceId,
    /// Payload fields do not fit the record schema
    Schema(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MissingDeviceId => write!(f, "no device_id in payload or topic"),
            DecodeError::Schema(msg) => write!(f, "invalid payload: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Schema(e.to_string())
    }
}

/// Parse an ISO-8601 timestamp. Offsets are honoured; naive timestamps are
/// taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw))),
        None => Ok(None),
    }
}

/// Resolve the device a message belongs to: the payload's `device_id` wins,
/// otherwise the second level of `devices/{id}/...`.
///
/// The id keys caches and storage, so it must be a valid single topic level.
pub fn device_id_for(topic: &str, payload: &Value) -> Result<String, DecodeError> {
    let from_payload = payload
        .get("device_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty());
    let id = match from_payload {
        Some(id) => id,
        None => {
            let mut levels = topic.split('/');
            match (levels.next(), levels.next(), levels.next()) {
                (Some(_), Some(id), Some(_)) if !id.is_empty() => id,
                _ => return Err(DecodeError::MissingDeviceId),
            }
        }
    };
    crate::topic::validate_device_id(id)
        .map_err(|reason| DecodeError::Schema(format!("device_id: {}", reason)))?;
    Ok(id.to_string())
}

/// One telemetry sample from a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Environmental temperature (celsius)
    pub env_temperature: f64,
    /// Environmental humidity (percentage)
    pub humidity: f64,
    /// Atmospheric pressure (hPa)
    pub pressure: f64,
    /// Light intensity (lux)
    pub light: f64,
    /// CO2 concentration (ppm)
    pub co2: f64,
    /// Volatile organic compounds (ppb)
    pub voc: f64,
    /// Soil temperature (celsius)
    pub soil_temperature: f64,
    /// Soil moisture (percentage)
    pub soil_moisture: f64,
    pub soil_ph: f64,
}

#[derive(Deserialize)]
struct TelemetryPayload {
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    env_temperature: f64,
    humidity: f64,
    pressure: f64,
    light: f64,
    co2: f64,
    voc: f64,
    soil_temperature: f64,
    soil_moisture: f64,
    soil_ph: f64,
}

impl TelemetryRecord {
    /// Decode a telemetry payload received on `topic`
    pub fn from_payload(topic: &str, payload: &Value) -> Result<Self, DecodeError> {
        let device_id = device_id_for(topic, payload)?;
        let body = TelemetryPayload::deserialize(payload)?;

        Ok(Self {
            device_id,
            timestamp: body.timestamp.unwrap_or_else(Utc::now),
            env_temperature: body.env_temperature,
            humidity: body.humidity,
            pressure: body.pressure,
            light: body.light,
            co2: body.co2,
            voc: body.voc,
            soil_temperature: body.soil_temperature,
            soil_moisture: body.soil_moisture,
            soil_ph: body.soil_ph,
        })
    }
}

/// Operational state reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Error,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status report from a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeviceStatus,
    pub firmware_version: String,
    pub uptime_seconds: u64,
    /// WiFi signal strength (dBm)
    pub signal_strength: i64,
    pub error_code: i64,
    pub error_message: String,
    /// Bytes
    pub free_memory: Option<u64>,
    pub internal_temperature: f64,
    pub internal_humidity: f64,
    /// Percentage (0-100)
    pub battery_level: Option<u8>,
}

#[derive(Deserialize)]
struct StatusPayload {
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    status: DeviceStatus,
    #[serde(default)]
    firmware_version: String,
    #[serde(default)]
    uptime_seconds: u64,
    #[serde(default, alias = "rssi")]
    signal_strength: i64,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    free_memory: Option<u64>,
    #[serde(default)]
    internal_temperature: f64,
    #[serde(default)]
    internal_humidity: f64,
    #[serde(default)]
    battery_level: Option<u8>,
}

impl DeviceStatusRecord {
    /// Decode a status payload received on `topic`. Missing fields take
    /// their neutral defaults; a missing status reads as offline.
    pub fn from_payload(topic: &str, payload: &Value) -> Result<Self, DecodeError> {
        let device_id = device_id_for(topic, payload)?;
        let body = StatusPayload::deserialize(payload)?;

        Ok(Self {
            device_id,
            timestamp: body.timestamp.unwrap_or_else(Utc::now),
            status: body.status,
            firmware_version: body.firmware_version,
            uptime_seconds: body.uptime_seconds,
            signal_strength: body.signal_strength,
            error_code: body.error_code,
            error_message: body.error_message,
            free_memory: body.free_memory,
            internal_temperature: body.internal_temperature,
            internal_humidity: body.internal_humidity,
            battery_level: body.battery_level,
        })
    }
}

/// Status payload the gateway substitutes for a device that missed a probe
pub fn probe_timeout_status(device_id: &str, at: DateTime<Utc>) -> Value {
    serde_json::json!({
        "device_id": device_id,
        "timestamp": at.to_rfc3339(),
        "status": DeviceStatus::Offline.as_str(),
        "error_code": PROBE_TIMEOUT_ERROR_CODE,
        "error_message": PROBE_TIMEOUT_ERROR_MESSAGE,
    })
}

/// Command sent to a device on `devices/{id}/commands`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl DeviceCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Wire body, stamped with the send time
    pub fn to_payload(&self, at: DateTime<Utc>) -> Value {
        serde_json::json!({
            "command": self.command,
            "parameters": self.parameters,
            "timestamp": at.to_rfc3339(),
        })
    }
}

/// Partial device configuration pushed on `devices/{id}/config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// Seconds between telemetry samples
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_interval: Option<u32>,
    /// Seconds between camera snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_interval: Option<u32>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.telemetry_interval.is_none() && self.snapshot_interval.is_none()
    }

    /// Wire body: only the fields that are set, plus the send time
    pub fn to_payload(&self, at: DateTime<Utc>) -> Value {
        let mut body = Map::new();
        if let Some(interval) = self.telemetry_interval {
            body.insert("telemetry_interval".into(), interval.into());
        }
        if let Some(interval) = self.snapshot_interval {
            body.insert("snapshot_interval".into(), interval.into());
        }
        body.insert("timestamp".into(), at.to_rfc3339().into());
        Value::Object(body)
    }
}

/// Reply to a discovery announcement
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResponse {
    pub device_id: String,
    pub accepted: bool,
    pub gateway_id: String,
    pub mqtt_topics: BTreeMap<&'static str, String>,
    pub ntp_server: String,
    pub timestamp: DateTime<Utc>,
}

impl DiscoveryResponse {
    pub fn accept(device_id: &str, gateway_id: &str, ntp_server: &str) -> Self {
        let mut mqtt_topics = BTreeMap::new();
        mqtt_topics.insert("telemetry", format!("devices/{}/telemetry", device_id));
        mqtt_topics.insert("commands", format!("devices/{}/commands", device_id));
        mqtt_topics.insert("config", format!("devices/{}/config", device_id));

        Self {
            device_id: device_id.to_string(),
            accepted: true,
            gateway_id: gateway_id.to_string(),
            mqtt_topics,
            ntp_server: ntp_server.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Liveness probe published on `gateway/ping`
#[derive(Debug, Clone, Serialize)]
pub struct GatewayPing {
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl GatewayPing {
    pub fn new(gateway_id: &str) -> Self {
        Self {
            gateway_id: gateway_id.to_string(),
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            kind: "status_request",
        }
    }
}
