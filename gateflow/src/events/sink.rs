//! Event sink trait and implementations.

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Receives engine lifecycle events.
///
/// Emitting must never fail or block for long; sinks swallow their own errors.
pub trait EventSink: Send + Sync {
    /// Emits an event.
    fn emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level (`DEBUG` or `INFO`).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        let field = |key: &str| {
            data.as_ref()
                .and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let stage = field("stage");
        let artifact = field("artifact");
        let payload = data.as_ref().map(Value::to_string).unwrap_or_default();
        if self.level == Level::DEBUG {
            debug!(event = %event_type, stage = %stage, artifact = %artifact, data = %payload, "Pipeline event");
        } else {
            info!(event = %event_type, stage = %stage, artifact = %artifact, data = %payload, "Pipeline event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns just the event names, in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.events.read().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Payloads of events emitted for one stage.
    #[must_use]
    pub fn for_stage(&self, stage: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(_, d)| d.as_ref().and_then(|d| d.get("stage")).and_then(Value::as_str) == Some(stage))
            .cloned()
            .collect()
    }

    /// Returns events whose name starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::names;
    use std::sync::Arc;

    #[test]
    fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(names::RUN_STARTED, None);
        LoggingEventSink::default().emit(names::STAGE_STARTED, Some(serde_json::json!({"stage": "fmt"})));
        LoggingEventSink::debug().emit(names::CACHE_MISS, None);
    }

    #[test]
    fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(names::STAGE_STARTED, Some(serde_json::json!({"stage": "fmt"})));
        sink.emit(names::STAGE_SUCCEEDED, None);
        sink.emit(names::CACHE_HIT, None);

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.names()[2], names::CACHE_HIT);
        assert_eq!(sink.for_stage("fmt").len(), 1);
    }

    #[test]
    fn test_sink_as_trait_object() {
        let collecting = Arc::new(CollectingEventSink::new());
        let sink: Arc<dyn EventSink> = collecting.clone();
        sink.emit(names::RUN_COMPLETED, Some(serde_json::json!({"state": "succeeded"})));

        let events = collecting.events();
        assert_eq!(events[0].1.as_ref().map(|d| d["state"].clone()), Some(serde_json::json!("succeeded")));
    }
}
