//! Wire types exchanged between a parent and an isolated worker.

use crate::{SessionEvent, WorkerError};
use loom_llm::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Parent-side capability a worker cannot satisfy on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyCapability {
    Mcp,
    Python,
    Lsp,
}

impl ProxyCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mcp => "mcp",
            Self::Python => "python",
            Self::Lsp => "lsp",
        }
    }

    /// Only interpreter calls can be cancelled individually.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Python)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCall {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Terminal response to a [`ProxyCall`]. Exactly one of `result` and `error` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResult {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResult {
    pub fn ok(call_id: impl Into<String>, result: Value) -> Self {
        Self {
            call_id: call_id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, WorkerError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(WorkerError::CallFailed(error)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(WorkerError::Validation(format!(
                "result for {} carries neither result nor error",
                self.call_id
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCancel {
    pub call_id: String,
}

/// A tool the worker exposes locally and forwards to the parent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyToolSpec {
    pub capability: ProxyCapability,
    pub definition: ToolDefinition,
}

/// Everything an isolated worker needs to run one task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStartPayload {
    pub parent_session_id: String,
    pub task: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default)]
    pub tools: Vec<ProxyToolSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDone {
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub tokens: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Start(WorkerStartPayload),
    Abort,
    McpCall(ProxyCall),
    McpResult(ProxyResult),
    PythonCall(ProxyCall),
    PythonResult(ProxyResult),
    PythonCancel(ProxyCancel),
    LspCall(ProxyCall),
    LspResult(ProxyResult),
    Event { event: SessionEvent },
    Done(WorkerDone),
}

impl WorkerMessage {
    pub fn call(capability: ProxyCapability, call: ProxyCall) -> Self {
        match capability {
            ProxyCapability::Mcp => Self::McpCall(call),
            ProxyCapability::Python => Self::PythonCall(call),
            ProxyCapability::Lsp => Self::LspCall(call),
        }
    }

    pub fn result(capability: ProxyCapability, result: ProxyResult) -> Self {
        match capability {
            ProxyCapability::Mcp => Self::McpResult(result),
            ProxyCapability::Python => Self::PythonResult(result),
            ProxyCapability::Lsp => Self::LspResult(result),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Abort => "abort",
            Self::McpCall(_) => "mcp_call",
            Self::McpResult(_) => "mcp_result",
            Self::PythonCall(_) => "python_call",
            Self::PythonResult(_) => "python_result",
            Self::PythonCancel(_) => "python_cancel",
            Self::LspCall(_) => "lsp_call",
            Self::LspResult(_) => "lsp_result",
            Self::Event { .. } => "event",
            Self::Done(_) => "done",
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::McpCall(call) | Self::PythonCall(call) | Self::LspCall(call) => {
                Some(&call.call_id)
            }
            Self::McpResult(result) | Self::PythonResult(result) | Self::LspResult(result) => {
                Some(&result.call_id)
            }
            Self::PythonCancel(cancel) => Some(&cancel.call_id),
            _ => None,
        }
    }

    /// Check correlation ids and the result/error exclusivity of responses.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if let Some(call_id) = self.call_id() {
            if call_id.trim().is_empty() {
                return Err(WorkerError::Validation(format!(
                    "{} without a callId",
                    self.type_name()
                )));
            }
        }
        match self {
            Self::McpResult(result) | Self::PythonResult(result) | Self::LspResult(result) => {
                if result.result.is_some() == result.error.is_some() {
                    return Err(WorkerError::Validation(format!(
                        "{} for {} must carry exactly one of result and error",
                        self.type_name(),
                        result.call_id
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn encode_line(&self) -> Result<String, WorkerError> {
        serde_json::to_string(self).map_err(|error| WorkerError::Validation(error.to_string()))
    }

    /// Decode and validate one line of the line-delimited wire form.
    pub fn decode_line(line: &str) -> Result<Self, WorkerError> {
        let message: Self = serde_json::from_str(line.trim())
            .map_err(|error| WorkerError::Validation(error.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// One end of an in-process duplex worker channel.
pub struct WorkerChannel {
    pub sender: mpsc::UnboundedSender<WorkerMessage>,
    pub receiver: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// Create a connected pair: `(parent_end, worker_end)`.
pub fn worker_channel() -> (WorkerChannel, WorkerChannel) {
    let (to_worker, from_parent) = mpsc::unbounded_channel();
    let (to_parent, from_worker) = mpsc::unbounded_channel();
    (
        WorkerChannel {
            sender: to_worker,
            receiver: from_worker,
        },
        WorkerChannel {
            sender: to_parent,
            receiver: from_parent,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn proxy_messages_use_snake_case_tags_and_camel_case_ids() {
        let message = WorkerMessage::call(
            ProxyCapability::Python,
            ProxyCall {
                call_id: "c1".to_string(),
                tool_name: "python".to_string(),
                arguments: json!({ "code": "1+1" }),
            },
        );
        let value = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(value["type"], "python_call");
        assert_eq!(value["callId"], "c1");
        assert_eq!(value["toolName"], "python");

        let decoded = WorkerMessage::decode_line(r#"{"type":"python_cancel","callId":"c1"}"#)
            .expect("cancel should decode");
        assert_eq!(decoded.call_id(), Some("c1"));
        assert_eq!(
            WorkerMessage::decode_line(r#"{"type":"abort"}"#).expect("abort should decode"),
            WorkerMessage::Abort
        );
    }

    #[test]
    fn results_must_carry_exactly_one_of_result_and_error() {
        let both = WorkerMessage::McpResult(ProxyResult {
            call_id: "c1".to_string(),
            result: Some(json!(1)),
            error: Some("boom".to_string()),
        });
        assert!(matches!(both.validate(), Err(WorkerError::Validation(_))));

        let neither = WorkerMessage::LspResult(ProxyResult {
            call_id: "c1".to_string(),
            result: None,
            error: None,
        });
        assert!(neither.validate().is_err());

        assert!(
            WorkerMessage::McpResult(ProxyResult::ok("c1", json!("x")))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn empty_call_ids_and_unknown_types_are_rejected() {
        assert!(WorkerMessage::decode_line(r#"{"type":"mcp_call","callId":"","toolName":"x"}"#)
            .is_err());
        assert!(WorkerMessage::decode_line(r#"{"type":"teleport"}"#).is_err());
        assert!(WorkerMessage::decode_line("not json").is_err());
    }

    #[test]
    fn done_round_trips_through_a_line() {
        let done = WorkerMessage::Done(WorkerDone {
            exit_code: 0,
            duration_ms: 12,
            output: "ok".to_string(),
            ..WorkerDone::default()
        });
        let line = done.encode_line().expect("done should encode");
        assert!(line.contains(r#""durationMs":12"#));
        assert_eq!(
            WorkerMessage::decode_line(&line).expect("done should decode"),
            done
        );
    }

    #[test]
    fn proxy_result_into_result_maps_error_to_call_failure() {
        assert_eq!(
            ProxyResult::err("c1", "denied").into_result(),
            Err(WorkerError::CallFailed("denied".to_string()))
        );
        assert_eq!(
            ProxyResult::ok("c1", json!({ "ok": true })).into_result(),
            Ok(json!({ "ok": true }))
        );
    }
}
