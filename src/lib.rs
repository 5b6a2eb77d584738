//! Fieldlink - MQTT field gateway with live WebSocket fan-out
//!
//! Ingests telemetry and status events from field devices over MQTT, keeps a
//! live view of device health, and streams the data to interactive clients
//! over WebSocket connections.

pub mod config;
pub mod fanout;
pub mod gateway;
pub mod ingress;
pub mod liveness;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod telemetry;
pub mod topic;
pub mod transport;

pub use config::Config;
pub use fanout::{ConnectionManager, LiveConnection};
pub use gateway::Gateway;
pub use ingress::{IngressAdapter, IngressEvent, MessageBus};
pub use liveness::{LivenessTracker, SweepOutcome};
pub use persistence::{DeviceStore, FjallBackend, MemoryStore};
pub use registry::{MessageHandler, SubscriptionRegistry};
pub use telemetry::TelemetryCache;
pub use transport::WsServer;
