//! Broker Connection Configuration
//!
//! Settings for the MQTT connection the gateway uses to reach its devices.

use std::time::Duration;

use serde::Deserialize;

/// Connection to the MQTT broker the devices publish to
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address (host:port or just host)
    pub address: String,

    /// Client ID; defaults to `{gateway.id}-backend`
    pub client_id: Option<String>,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    pub keepalive: u16,

    /// Start each connection without a stored session
    pub clean_session: bool,

    /// QoS used for subscriptions and outbound publishes (0, 1, or 2)
    pub qos: u8,

    /// Reconnect interval in seconds
    pub reconnect_interval: u64,

    /// Maximum reconnect interval in seconds (for exponential backoff)
    pub max_reconnect_interval: u64,

    /// Capacity of the handoff queue from the client thread to the dispatcher
    pub queue_capacity: usize,

    /// Capacity of the client's outgoing request queue
    pub request_capacity: usize,
}

fn default_address() -> String {
    "localhost:1883".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            client_id: None,
            username: None,
            password: None,
            keepalive: 60,
            clean_session: true,
            qos: 1,
            reconnect_interval: 1,
            max_reconnect_interval: 120,
            queue_capacity: 1024,
            request_capacity: 100,
        }
    }
}

impl MqttConfig {
    /// Get the reconnect interval as Duration
    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Get the max reconnect interval as Duration
    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval)
    }

    /// Parse address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), 1883)
    }

    /// Client ID to present to the broker
    pub fn client_id_for(&self, gateway_id: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{}-backend", gateway_id))
    }

    /// Configured QoS as the client library's type
    pub fn qos_level(&self) -> rumqttc::QoS {
        match self.qos {
            0 => rumqttc::QoS::AtMostOnce,
            1 => rumqttc::QoS::AtLeastOnce,
            _ => rumqttc::QoS::ExactlyOnce,
        }
    }
}
