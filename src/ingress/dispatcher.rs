//! Ingress dispatcher task
//!
//! Drains the event channel in order. Connection events update the adapter's
//! flag and restore broker subscriptions; messages go to the registry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{IngressAdapter, IngressEvent, MessageBus};
use crate::registry::SubscriptionRegistry;

/// Run until the channel closes or `cancel` fires
pub async fn run_dispatcher(
    adapter: Arc<IngressAdapter>,
    registry: Arc<SubscriptionRegistry>,
    mut events: mpsc::Receiver<IngressEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(&adapter, &registry, event).await;
    }
    debug!("Ingress dispatcher stopped");
}

async fn handle_event(
    adapter: &IngressAdapter,
    registry: &SubscriptionRegistry,
    event: IngressEvent,
) {
    match event {
        IngressEvent::Connected => {
            adapter.set_connected(true);
            resubscribe(adapter, registry);
        }
        IngressEvent::Disconnected { reason } => {
            adapter.set_connected(false);
            info!("Broker connection down: {}", reason);
        }
        IngressEvent::Message { topic, payload } => {
            let report = registry.dispatch(&topic, &payload).await;
            if report.failed > 0 {
                debug!(
                    "{} of {} handlers failed for {}",
                    report.failed, report.invoked, topic
                );
            }
        }
    }
}

/// Restore every registered pattern on the broker
fn resubscribe(bus: &dyn MessageBus, registry: &SubscriptionRegistry) {
    for pattern in registry.patterns() {
        if let Err(e) = bus.subscribe_remote(&pattern) {
            warn!("Failed to subscribe to {}: {}", pattern, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ingress::testing::RecordingBus;
    use crate::registry::from_fn;
    use parking_lot::Mutex;
    use serde_json::json;

    /// The client's connection owns a runtime, which must not be dropped on
    /// an async worker
    fn release(connection: rumqttc::Connection) {
        std::thread::spawn(move || drop(connection)).join().unwrap();
    }

    #[test]
    fn test_resubscribe_covers_every_pattern() {
        let registry = SubscriptionRegistry::new();
        let noop = from_fn(|_, _| async { Ok(()) });
        registry.subscribe("devices/+/telemetry", Arc::clone(&noop));
        registry.subscribe("devices/+/status", Arc::clone(&noop));
        registry.subscribe("devices/+/telemetry", noop);

        let bus = RecordingBus::new();
        resubscribe(&bus, &registry);
        assert_eq!(
            *bus.subscribed.lock(),
            vec!["devices/+/telemetry".to_string(), "devices/+/status".to_string()]
        );
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        let (adapter, connection) = IngressAdapter::new(&Config::default());
        let registry = Arc::new(SubscriptionRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            registry.subscribe(
                "devices/+/telemetry",
                from_fn(move |topic, payload| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().push((topic, payload["seq"].as_i64()));
                        Ok(())
                    }
                }),
            );
        }

        let (tx, rx) = mpsc::channel(8);
        tx.send(IngressEvent::Connected).await.unwrap();
        for seq in 0..3 {
            tx.send(IngressEvent::Message {
                topic: format!("devices/d{}/telemetry", seq),
                payload: json!({ "seq": seq }),
            })
            .await
            .unwrap();
        }
        drop(tx);

        run_dispatcher(
            Arc::clone(&adapter),
            registry,
            rx,
            CancellationToken::new(),
        )
        .await;

        assert!(adapter.is_connected());
        assert_eq!(
            *seen.lock(),
            vec![
                ("devices/d0/telemetry".to_string(), Some(0)),
                ("devices/d1/telemetry".to_string(), Some(1)),
                ("devices/d2/telemetry".to_string(), Some(2)),
            ]
        );
        release(connection);
    }

    #[tokio::test]
    async fn test_disconnect_clears_flag() {
        let (adapter, connection) = IngressAdapter::new(&Config::default());
        let registry = Arc::new(SubscriptionRegistry::new());

        let (tx, rx) = mpsc::channel(4);
        tx.send(IngressEvent::Connected).await.unwrap();
        tx.send(IngressEvent::Disconnected {
            reason: "network".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        run_dispatcher(Arc::clone(&adapter), registry, rx, CancellationToken::new()).await;
        assert!(!adapter.is_connected());
        release(connection);
    }
}
