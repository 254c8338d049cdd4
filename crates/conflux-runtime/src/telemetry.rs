//! Telemetry side-channel
//!
//! Runs report what they do through a [`TelemetrySink`]. Sinks observe; they
//! never influence control flow, and a sink that drops everything leaves a
//! run's result unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A pipeline or workflow run began
    RunStarted,
    /// A run reached its terminal status
    RunFinished,
    /// A pipeline stage began
    StageStarted,
    /// A pipeline stage ended
    StageFinished,
    /// A workflow step began
    StepStarted,
    /// A workflow step ended
    StepFinished,
    /// The resilience layer is making an attempt
    AttemptStarted,
    /// An attempt failed
    AttemptFailed,
    /// A failed attempt will be retried after a delay
    RetryScheduled,
    /// A circuit breaker changed state
    BreakerStateChanged,
}

/// One structured event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Run the event belongs to
    pub run_id: String,
    /// Workflow step, when inside one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Event kind
    pub event_kind: EventKind,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Kind-specific attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl TelemetryEvent {
    /// Add an attribute
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Attribute by name
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Run and step an event is attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventScope {
    /// Run id
    pub run_id: String,
    /// Step id, inside a workflow step
    pub step_id: Option<String>,
}

impl EventScope {
    /// Scope of a whole run
    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: None,
        }
    }

    /// Narrow to one step
    pub fn step(&self, step_id: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id.clone(),
            step_id: Some(step_id.into()),
        }
    }

    /// New event in this scope, stamped now
    pub fn event(&self, kind: EventKind) -> TelemetryEvent {
        TelemetryEvent {
            run_id: self.run_id.clone(),
            step_id: self.step_id.clone(),
            event_kind: kind,
            timestamp: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Receiver of telemetry events
pub trait TelemetrySink: Send + Sync {
    /// Record one event; must not block
    fn emit(&self, event: TelemetryEvent);
}

/// Forwards events to `tracing` under the `conflux::telemetry` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        let attributes = serde_json::to_string(&event.attributes).unwrap_or_default();
        match event.event_kind {
            EventKind::AttemptFailed | EventKind::RetryScheduled | EventKind::BreakerStateChanged => {
                tracing::warn!(
                    target: "conflux::telemetry",
                    run_id = %event.run_id,
                    step_id = event.step_id.as_deref().unwrap_or(""),
                    kind = ?event.event_kind,
                    %attributes,
                    "telemetry event"
                );
            }
            EventKind::RunStarted | EventKind::RunFinished => {
                tracing::info!(
                    target: "conflux::telemetry",
                    run_id = %event.run_id,
                    kind = ?event.event_kind,
                    %attributes,
                    "telemetry event"
                );
            }
            _ => {
                tracing::debug!(
                    target: "conflux::telemetry",
                    run_id = %event.run_id,
                    step_id = event.step_id.as_deref().unwrap_or(""),
                    kind = ?event.event_kind,
                    %attributes,
                    "telemetry event"
                );
            }
        }
    }
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Keeps every event in memory
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl CollectingSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything collected so far
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Collected events of one kind
    pub fn of_kind(&self, kind: EventKind) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_kind == kind)
            .collect()
    }
}

impl TelemetrySink for CollectingSink {
    fn emit(&self, event: TelemetryEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Shared sink handle
pub type SharedSink = Arc<dyn TelemetrySink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_stamps_run_and_step() {
        let scope = EventScope::run("run-1").step("extract");
        let event = scope
            .event(EventKind::StepStarted)
            .with("type", "Extract");
        assert_eq!(event.run_id, "run-1");
        assert_eq!(event.step_id.as_deref(), Some("extract"));
        assert_eq!(event.attribute("type"), Some(&Value::from("Extract")));
    }

    #[test]
    fn test_collecting_sink_filters_by_kind() {
        let sink = CollectingSink::new();
        let scope = EventScope::run("r");
        sink.emit(scope.event(EventKind::RunStarted));
        sink.emit(scope.event(EventKind::AttemptStarted));
        sink.emit(scope.event(EventKind::AttemptStarted));
        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.of_kind(EventKind::AttemptStarted).len(), 2);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = EventScope::run("r").event(EventKind::RetryScheduled).with("delayMs", 200);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["runId"], "r");
        assert_eq!(json["eventKind"], "RetryScheduled");
        assert!(json.get("stepId").is_none());
        assert_eq!(json["attributes"]["delayMs"], 200);
    }

    #[test]
    fn test_noop_and_tracing_sinks_accept_events() {
        let event = EventScope::run("r").event(EventKind::RunFinished);
        NoopSink.emit(event.clone());
        TracingSink.emit(event);
    }
}
