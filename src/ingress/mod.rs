//! Ingress Adapter
//!
//! Bridges the MQTT client, whose event loop runs on its own OS thread, into
//! the async scheduler. Broker events cross the boundary as [`IngressEvent`]s
//! over a bounded FIFO channel; nothing else is shared with the thread.
//!
//! - [`client`]: the adapter and the client thread
//! - [`dispatcher`]: the task that turns events into registry dispatches

mod client;
mod dispatcher;

pub use client::{decode_payload, IngressAdapter};
pub use dispatcher::run_dispatcher;

use std::fmt;

use rumqttc::QoS;
use serde_json::Value;

/// Ingress errors
#[derive(Debug)]
pub enum IngressError {
    /// No live broker connection
    NotConnected,
    /// The client refused the request
    Client(String),
    /// Inbound payload is not a JSON object
    Decode(String),
    /// Topic is not a valid MQTT topic name or filter
    InvalidTopic(String),
}

impl fmt::Display for IngressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressError::NotConnected => write!(f, "not connected to broker"),
            IngressError::Client(msg) => write!(f, "client error: {}", msg),
            IngressError::Decode(msg) => write!(f, "decode error: {}", msg),
            IngressError::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
        }
    }
}

impl std::error::Error for IngressError {}

impl From<rumqttc::ClientError> for IngressError {
    fn from(e: rumqttc::ClientError) -> Self {
        IngressError::Client(e.to_string())
    }
}

/// Events handed from the client thread to the dispatcher, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum IngressEvent {
    /// Broker accepted the connection
    Connected,
    /// An established connection dropped
    Disconnected { reason: String },
    /// Inbound message with its decoded payload
    Message { topic: String, payload: Value },
}

/// Outbound side of the broker connection
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish of a JSON payload
    fn publish(&self, topic: &str, payload: &Value, qos: QoS, retain: bool)
        -> Result<(), IngressError>;

    /// Ask the broker for messages matching `pattern`
    fn subscribe_remote(&self, pattern: &str) -> Result<(), IngressError>;

    /// Whether the broker connection is currently up
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process bus that records publishes

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub struct Published {
        pub topic: String,
        pub payload: Value,
        pub qos: QoS,
        pub retain: bool,
    }

    pub struct RecordingBus {
        pub published: Mutex<Vec<Published>>,
        pub subscribed: Mutex<Vec<String>>,
        connected: AtomicBool,
    }

    impl RecordingBus {
        pub fn new() -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                subscribed: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
            }
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        pub fn published_on(&self, topic: &str) -> Vec<Published> {
            self.published
                .lock()
                .iter()
                .filter(|p| p.topic == topic)
                .cloned()
                .collect()
        }
    }

    impl MessageBus for RecordingBus {
        fn publish(
            &self,
            topic: &str,
            payload: &Value,
            qos: QoS,
            retain: bool,
        ) -> Result<(), IngressError> {
            if !self.is_connected() {
                return Err(IngressError::NotConnected);
            }
            self.published.lock().push(Published {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                retain,
            });
            Ok(())
        }

        fn subscribe_remote(&self, pattern: &str) -> Result<(), IngressError> {
            self.subscribed.lock().push(pattern.to_string());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
