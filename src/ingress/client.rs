//! MQTT Ingress Client
//!
//! Owns the broker connection. The client's event loop blocks, so it runs on
//! a dedicated OS thread and forwards every event through a bounded channel.
//! The connected flag is written only by the dispatcher, which sees events in
//! the same order the thread produced them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{Client, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{IngressError, IngressEvent, MessageBus};
use crate::config::Config;
use crate::topic;

/// Decode an inbound payload; it must be a UTF-8 JSON object
pub fn decode_payload(payload: &[u8]) -> Result<Value, IngressError> {
    let text = std::str::from_utf8(payload).map_err(|e| IngressError::Decode(e.to_string()))?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| IngressError::Decode(e.to_string()))?;
    if !value.is_object() {
        return Err(IngressError::Decode("payload is not a JSON object".to_string()));
    }
    Ok(value)
}

/// Handle on the broker connection
pub struct IngressAdapter {
    client: Client,
    qos: QoS,
    connected: AtomicBool,
    stopping: Arc<AtomicBool>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Longest the client thread sleeps between checks for a stop request
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl IngressAdapter {
    /// Create the client without starting its event loop
    pub fn new(config: &Config) -> (Arc<Self>, Connection) {
        let mqtt = &config.mqtt;
        let (host, port) = mqtt.parse_address();
        let mut options = MqttOptions::new(mqtt.client_id_for(&config.gateway.id), host, port);
        options
            .set_keep_alive(Duration::from_secs(u64::from(mqtt.keepalive)))
            .set_clean_session(mqtt.clean_session);
        if let Some(username) = &mqtt.username {
            options.set_credentials(username.clone(), mqtt.password.clone().unwrap_or_default());
        }

        let (client, connection) = Client::new(options, mqtt.request_capacity);

        let adapter = Arc::new(Self {
            client,
            qos: mqtt.qos_level(),
            connected: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            event_thread: Mutex::new(None),
        });
        (adapter, connection)
    }

    /// Create the client and start its event-loop thread.
    ///
    /// Returns the adapter and the receiving end of the event channel, which
    /// belongs to the dispatcher.
    pub fn start(
        config: &Config,
    ) -> std::io::Result<(Arc<Self>, mpsc::Receiver<IngressEvent>)> {
        let (adapter, connection) = Self::new(config);
        let (tx, rx) = mpsc::channel(config.mqtt.queue_capacity);

        info!("Connecting to MQTT broker at {}", config.mqtt.address);
        let thread = adapter.spawn_event_thread(
            connection,
            tx,
            config.mqtt.reconnect_interval_duration(),
            config.mqtt.max_reconnect_interval_duration(),
        )?;
        *adapter.event_thread.lock() = Some(thread);
        Ok((adapter, rx))
    }

    fn spawn_event_thread(
        &self,
        connection: Connection,
        tx: mpsc::Sender<IngressEvent>,
        reconnect_interval: Duration,
        max_reconnect_interval: Duration,
    ) -> std::io::Result<JoinHandle<()>> {
        let stopping = Arc::clone(&self.stopping);
        thread::Builder::new()
            .name("fieldlink-mqtt".to_string())
            .spawn(move || {
                event_loop(
                    connection,
                    tx,
                    stopping,
                    reconnect_interval,
                    max_reconnect_interval,
                )
            })
    }

    /// QoS used for subscriptions and publishes
    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Request a clean disconnect; the event thread exits afterwards
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting from MQTT broker");
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        self.set_connected(false);
    }

    /// Hand over the client thread so shutdown can wait for it; `None` once
    /// taken or when the thread was never started
    pub fn take_event_thread(&self) -> Option<JoinHandle<()>> {
        self.event_thread.lock().take()
    }
}

impl MessageBus for IngressAdapter {
    fn publish(
        &self,
        topic: &str,
        payload: &Value,
        qos: QoS,
        retain: bool,
    ) -> Result<(), IngressError> {
        topic::validate_topic_name(topic)
            .map_err(|reason| IngressError::InvalidTopic(format!("{}: {}", topic, reason)))?;

        if !self.is_connected() {
            warn!("Cannot publish to {}: not connected", topic);
            return Err(IngressError::NotConnected);
        }

        let bytes =
            serde_json::to_vec(payload).map_err(|e| IngressError::Client(e.to_string()))?;
        self.client.try_publish(topic, qos, retain, bytes)?;
        debug!("Published to {}", topic);
        Ok(())
    }

    fn subscribe_remote(&self, pattern: &str) -> Result<(), IngressError> {
        topic::validate_topic_filter(pattern)
            .map_err(|reason| IngressError::InvalidTopic(format!("{}: {}", pattern, reason)))?;

        if !self.is_connected() {
            // Picked up by the resubscription on the next connect
            debug!("Deferring subscription to {} until connected", pattern);
            return Ok(());
        }
        self.client.try_subscribe(pattern, self.qos)?;
        info!("Subscribed to {}", pattern);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Body of the client thread
fn event_loop(
    mut connection: Connection,
    tx: mpsc::Sender<IngressEvent>,
    stopping: Arc<AtomicBool>,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
) {
    let mut retry_interval = reconnect_interval;
    let mut connected = false;

    for notification in connection.iter() {
        let event = match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    error!("Broker refused connection: {:?}", ack.code);
                    continue;
                }
                info!("Connected to MQTT broker");
                connected = true;
                retry_interval = reconnect_interval;
                Some(IngressEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => match decode_payload(&publish.payload)
            {
                Ok(payload) => Some(IngressEvent::Message {
                    topic: publish.topic,
                    payload,
                }),
                Err(e) => {
                    warn!("Dropping message on {}: {}", publish.topic, e);
                    None
                }
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected = false;
                Some(IngressEvent::Disconnected {
                    reason: "broker sent disconnect".to_string(),
                })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Client disconnect sent");
                break;
            }
            Ok(_) => None,
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }

                let lost = if connected {
                    connected = false;
                    Some(IngressEvent::Disconnected {
                        reason: e.to_string(),
                    })
                } else {
                    None
                };
                if let Some(event) = lost {
                    warn!("MQTT connection lost: {}", e);
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                } else {
                    error!("MQTT connection failed: {}", e);
                }

                debug!("Reconnecting in {:?}", retry_interval);
                sleep_unless_stopping(retry_interval, &stopping);
                retry_interval = std::cmp::min(retry_interval * 2, max_reconnect_interval);
                None
            }
        };

        if let Some(event) = event {
            if tx.blocking_send(event).is_err() {
                debug!("Event channel closed");
                break;
            }
        }

        if stopping.load(Ordering::SeqCst) {
            break;
        }
    }

    if connected {
        let _ = tx.blocking_send(IngressEvent::Disconnected {
            reason: "client stopped".to_string(),
        });
    }
    info!("MQTT event loop stopped");
}

/// Sleep for `duration`, returning early once a stop is requested
fn sleep_unless_stopping(duration: Duration, stopping: &AtomicBool) {
    let deadline = std::time::Instant::now() + duration;
    while !stopping.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(STOP_POLL_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_payload() {
        let value = decode_payload(br#"{"device_id":"d1","co2":410}"#).unwrap();
        assert_eq!(value, json!({"device_id": "d1", "co2": 410}));

        assert!(matches!(
            decode_payload(b"[1,2,3]"),
            Err(IngressError::Decode(_))
        ));
        assert!(matches!(
            decode_payload(b"{not json"),
            Err(IngressError::Decode(_))
        ));
        assert!(matches!(
            decode_payload(&[0xff, 0xfe, b'{', b'}']),
            Err(IngressError::Decode(_))
        ));
    }

    #[test]
    fn test_publish_requires_connection() {
        let (adapter, _connection) = IngressAdapter::new(&Config::default());
        assert!(!adapter.is_connected());

        let result = adapter.publish("gateway/ping", &json!({}), QoS::AtLeastOnce, false);
        assert!(matches!(result, Err(IngressError::NotConnected)));

        adapter.set_connected(true);
        adapter
            .publish("gateway/ping", &json!({}), QoS::AtLeastOnce, false)
            .unwrap();
    }

    #[test]
    fn test_publish_rejects_wildcard_topic() {
        let (adapter, _connection) = IngressAdapter::new(&Config::default());
        adapter.set_connected(true);
        let result = adapter.publish("devices/+/commands", &json!({}), QoS::AtMostOnce, false);
        assert!(matches!(result, Err(IngressError::InvalidTopic(_))));
    }

    #[test]
    fn test_subscribe_deferred_while_disconnected() {
        let (adapter, _connection) = IngressAdapter::new(&Config::default());
        adapter.subscribe_remote("devices/+/status").unwrap();
        assert!(matches!(
            adapter.subscribe_remote("devices/#/status"),
            Err(IngressError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_stop_clears_connected() {
        let (adapter, _connection) = IngressAdapter::new(&Config::default());
        adapter.set_connected(true);
        adapter.stop();
        assert!(!adapter.is_connected());
        // Second stop is a no-op
        adapter.stop();
    }

    #[test]
    fn test_backoff_sleep_ends_on_stop() {
        let stopping = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopping);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });

        let started = std::time::Instant::now();
        sleep_unless_stopping(Duration::from_secs(60), &stopping);
        assert!(started.elapsed() < Duration::from_secs(5));
        stopper.join().unwrap();
    }

    #[test]
    fn test_stopped_event_thread_can_be_joined() {
        let mut config = Config::default();
        // Nothing listens here, so the thread sits in its reconnect backoff
        config.mqtt.address = "127.0.0.1:1".to_string();
        config.mqtt.reconnect_interval = 30;
        config.mqtt.max_reconnect_interval = 60;
        let (adapter, _events) = IngressAdapter::start(&config).unwrap();
        thread::sleep(Duration::from_millis(100));

        adapter.stop();
        let event_thread = adapter.take_event_thread().expect("thread handle kept");
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !event_thread.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(event_thread.is_finished());
        event_thread.join().unwrap();
        assert!(adapter.take_event_thread().is_none());
    }
}
