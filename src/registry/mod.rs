//! Subscription Registry
//!
//! Maps topic patterns to ordered lists of message handlers. Dispatch selects
//! every registered pattern that equals or wildcard-matches an inbound topic
//! and runs its handlers in registration order. A failing handler is logged
//! and never stops the others.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::ingress::IngressError;
use crate::models::DecodeError;
use crate::persistence::PersistenceError;
use crate::topic;

/// Errors a message handler can report
#[derive(Debug)]
pub enum HandlerError {
    /// Payload did not decode into the expected record
    Decode(DecodeError),
    /// The durable store rejected a write
    Persistence(PersistenceError),
    /// A reply could not be published
    Publish(IngressError),
    /// Anything else
    Other(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Decode(e) => write!(f, "decode failed: {}", e),
            HandlerError::Persistence(e) => write!(f, "persistence failed: {}", e),
            HandlerError::Publish(e) => write!(f, "publish failed: {}", e),
            HandlerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<DecodeError> for HandlerError {
    fn from(e: DecodeError) -> Self {
        HandlerError::Decode(e)
    }
}

impl From<PersistenceError> for HandlerError {
    fn from(e: PersistenceError) -> Self {
        HandlerError::Persistence(e)
    }
}

impl From<IngressError> for HandlerError {
    fn from(e: IngressError) -> Self {
        HandlerError::Publish(e)
    }
}

/// Receives decoded messages for the patterns it is registered under
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &Value) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, topic: &str, payload: &Value) -> Result<(), HandlerError> {
        (self.0)(topic.to_string(), payload.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers run
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

/// Ordered pattern → handlers table
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<(String, Vec<Arc<dyn MessageHandler>>)>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler under `pattern`. Returns true when the pattern was
    /// not registered before.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn MessageHandler>) -> bool {
        if let Err(reason) = topic::validate_topic_filter(pattern) {
            warn!("Pattern '{}' is not a valid filter: {}", pattern, reason);
        }

        let mut entries = self.entries.write();
        if let Some((_, handlers)) = entries.iter_mut().find(|(p, _)| p == pattern) {
            handlers.push(handler);
            return false;
        }
        entries.push((pattern.to_string(), vec![handler]));
        true
    }

    /// Registered patterns in insertion order
    pub fn patterns(&self) -> Vec<String> {
        self.entries.read().iter().map(|(p, _)| p.clone()).collect()
    }

    /// Number of handlers registered under `pattern`
    pub fn handler_count(&self, pattern: &str) -> usize {
        self.entries
            .read()
            .iter()
            .find(|(p, _)| p == pattern)
            .map_or(0, |(_, handlers)| handlers.len())
    }

    /// Run every handler whose pattern selects `topic`
    pub async fn dispatch(&self, topic: &str, payload: &Value) -> DispatchReport {
        // Snapshot so handlers may subscribe while running
        let selected: Vec<(String, Arc<dyn MessageHandler>)> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(pattern, _)| pattern == topic || topic::matches(pattern, topic))
                .flat_map(|(pattern, handlers)| {
                    handlers.iter().map(move |h| (pattern.clone(), Arc::clone(h)))
                })
                .collect()
        };

        if selected.is_empty() {
            debug!("No handler for topic {}", topic);
        }

        let mut report = DispatchReport::default();
        for (pattern, handler) in selected {
            report.invoked += 1;
            match AssertUnwindSafe(handler.handle(topic, payload))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!("Handler for {} failed on {}: {}", pattern, topic, e);
                }
                Err(_) => {
                    report.failed += 1;
                    error!("Handler for {} panicked on {}", pattern, topic);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn MessageHandler> {
        let log = Arc::clone(log);
        from_fn(move |topic, _payload| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{}:{}", name, topic));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_dispatch_runs_handlers_in_order() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(registry.subscribe("devices/+/telemetry", recorder(&log, "a")));
        assert!(!registry.subscribe("devices/+/telemetry", recorder(&log, "b")));
        assert!(registry.subscribe("devices/#", recorder(&log, "c")));
        assert!(registry.subscribe("devices/+/status", recorder(&log, "d")));

        let report = registry
            .dispatch("devices/d1/telemetry", &json!({}))
            .await;

        assert_eq!(report, DispatchReport { invoked: 3, failed: 0 });
        assert_eq!(
            *log.lock(),
            vec![
                "a:devices/d1/telemetry".to_string(),
                "b:devices/d1/telemetry".to_string(),
                "c:devices/d1/telemetry".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_handler_under_two_patterns_runs_twice() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "h");

        registry.subscribe("devices/d1/status", Arc::clone(&handler));
        registry.subscribe("devices/+/status", handler);

        let report = registry.dispatch("devices/d1/status", &json!({})).await;
        assert_eq!(report.invoked, 2);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_dispatch() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.subscribe(
            "devices/+/alerts",
            from_fn(|_, _| async { Err(HandlerError::Other("boom".into())) }),
        );
        registry.subscribe(
            "devices/+/alerts",
            from_fn(|topic, _| async move {
                if topic.contains("alerts") {
                    panic!("handler bug");
                }
                Ok(())
            }),
        );
        registry.subscribe("devices/+/alerts", recorder(&log, "ok"));

        let report = registry.dispatch("devices/d2/alerts", &json!({})).await;
        assert_eq!(report, DispatchReport { invoked: 3, failed: 2 });
        assert_eq!(*log.lock(), vec!["ok:devices/d2/alerts".to_string()]);
    }

    #[tokio::test]
    async fn test_unmatched_topic_invokes_nothing() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe("devices/+/telemetry", recorder(&log, "a"));

        let report = registry.dispatch("gateway/ping", &json!({})).await;
        assert_eq!(report, DispatchReport::default());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_patterns_keep_insertion_order() {
        let registry = SubscriptionRegistry::new();
        let noop = from_fn(|_, _| async { Ok(()) });
        registry.subscribe("b/#", Arc::clone(&noop));
        registry.subscribe("a/+", Arc::clone(&noop));
        registry.subscribe("b/#", noop);

        assert_eq!(registry.patterns(), vec!["b/#".to_string(), "a/+".to_string()]);
        assert_eq!(registry.handler_count("b/#"), 2);
        assert_eq!(registry.handler_count("c"), 0);
    }
}
