use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    DirectiveStarted,
    DirectiveCompleted,
    TaskQueued,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetried,
    ExperimentStarted,
    VariantCompleted,
    ExperimentAssessed,
    ExperimentCompleted,
    ToolExecuted,
    CapabilityRequested,
}

impl TraceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::DirectiveStarted => "directive.started",
            TraceKind::DirectiveCompleted => "directive.completed",
            TraceKind::TaskQueued => "task.queued",
            TraceKind::TaskStarted => "task.started",
            TraceKind::TaskCompleted => "task.completed",
            TraceKind::TaskFailed => "task.failed",
            TraceKind::TaskRetried => "task.retried",
            TraceKind::ExperimentStarted => "experiment.started",
            TraceKind::VariantCompleted => "variant.completed",
            TraceKind::ExperimentAssessed => "experiment.assessed",
            TraceKind::ExperimentCompleted => "experiment.completed",
            TraceKind::ToolExecuted => "tool.executed",
            TraceKind::CapabilityRequested => "capability.requested",
        }
    }
}

/// Append-only trace record. Serialized flat as
/// `{"type": ..., "timestamp": ..., "id": ..., "seq": ..., ...payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub id: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl TraceEvent {
    pub fn new(kind: TraceKind, payload: Value) -> Self {
        Self::with_type(kind.as_str(), payload)
    }

    pub fn with_type(event_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            id: crate::new_id(),
            seq: 0,
            payload,
        }
    }

    pub fn is(&self, kind: TraceKind) -> bool {
        self.event_type == kind.as_str()
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}
