use crate::AgentError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type EventData = HashMap<String, Value>;

/// Build event data from a JSON object literal. Non-object values yield empty data.
pub fn event_data(value: Value) -> EventData {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => EventData::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    UserInput,
    AssistantMessage,
    ToolCallStart,
    ToolCallEnd,
    MessageQueued,
    QueueDelivered,
    Aborted,
    BranchNavigated,
    BranchSummarized,
    Pruned,
    ModelChanged,
    ThinkingLevelChanged,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub timestamp: String,
    pub session_id: String,
    pub data: EventData,
}

impl SessionEvent {
    pub fn new(kind: EventKind, session_id: impl Into<String>, data: EventData) -> Self {
        Self {
            kind,
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.into(),
            data,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: SessionEvent) -> Result<(), AgentError>;
}

#[derive(Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: SessionEvent) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedEventEmitter {
    inner: Arc<Mutex<Vec<SessionEvent>>>,
}

impl BufferedEventEmitter {
    pub fn snapshot(&self) -> Vec<SessionEvent> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.snapshot().into_iter().map(|event| event.kind).collect()
    }
}

impl EventEmitter for BufferedEventEmitter {
    fn emit(&self, event: SessionEvent) -> Result<(), AgentError> {
        match self.inner.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}
