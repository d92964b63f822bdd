mod task;

pub use task::*;

use crate::{AgentError, EventEmitter, EventKind, SessionEvent, event_data, truncate_tool_output};
use loom_llm::{AbortSignal, Message, ToolCallData, ToolDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, AgentError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

/// Per-call context handed to a tool executor.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub call_id: String,
    /// Aborted when the owning stream is aborted or the session is disposed.
    pub signal: AbortSignal,
    pub emitter: Arc<dyn EventEmitter>,
}

#[derive(Clone)]
pub struct ToolDispatchOptions {
    pub session_id: String,
    pub signal: AbortSignal,
    pub max_output_chars: usize,
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub executor: ToolExecutor,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Run one tool by name outside the model loop.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Value,
        context: ToolContext,
    ) -> Result<String, AgentError> {
        let registered = self
            .get(name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;
        validate_tool_arguments(&registered.definition.parameters, &arguments)?;
        (registered.executor)(arguments, context).await
    }

    /// Execute tool calls in order and return one tool-result message per call.
    ///
    /// Unknown tools, invalid arguments, executor errors and calls reached after
    /// an abort all become error results; they never fail the dispatch.
    pub async fn dispatch(
        &self,
        tool_calls: Vec<ToolCallData>,
        event_emitter: Arc<dyn EventEmitter>,
        options: ToolDispatchOptions,
    ) -> Result<Vec<Message>, AgentError> {
        let mut results = Vec::with_capacity(tool_calls.len());
        for tool_call in tool_calls {
            results.push(
                self.dispatch_single(tool_call, event_emitter.clone(), &options)
                    .await?,
            );
        }
        Ok(results)
    }

    async fn dispatch_single(
        &self,
        tool_call: ToolCallData,
        event_emitter: Arc<dyn EventEmitter>,
        options: &ToolDispatchOptions,
    ) -> Result<Message, AgentError> {
        event_emitter.emit(SessionEvent::new(
            EventKind::ToolCallStart,
            options.session_id.clone(),
            event_data(serde_json::json!({
                "tool_name": tool_call.name,
                "call_id": tool_call.id,
            })),
        ))?;

        let outcome = if options.signal.is_aborted() {
            Err("Tool execution aborted".to_string())
        } else if let Some(registered) = self.get(&tool_call.name) {
            match validate_tool_arguments(&registered.definition.parameters, &tool_call.arguments)
            {
                Err(error) => Err(error.to_string()),
                Ok(()) => {
                    let context = ToolContext {
                        session_id: options.session_id.clone(),
                        call_id: tool_call.id.clone(),
                        signal: options.signal.child(),
                        emitter: event_emitter.clone(),
                    };
                    (registered.executor)(tool_call.arguments.clone(), context)
                        .await
                        .map_err(|error| error.to_string())
                }
            }
        } else {
            Err(format!("Unknown tool: {}", tool_call.name))
        };

        let (text, is_error) = match outcome {
            Ok(output) => (truncate_tool_output(&output, options.max_output_chars), false),
            Err(message) => (message, true),
        };
        debug!(tool = %tool_call.name, call_id = %tool_call.id, is_error, "tool call finished");
        event_emitter.emit(SessionEvent::new(
            EventKind::ToolCallEnd,
            options.session_id.clone(),
            event_data(serde_json::json!({
                "tool_name": tool_call.name,
                "call_id": tool_call.id,
                "is_error": is_error,
            })),
        ))?;

        Ok(Message::tool_result(
            tool_call.id,
            tool_call.name,
            text,
            is_error,
        ))
    }
}

pub fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Result<(), AgentError> {
    let object = arguments.as_object().ok_or_else(|| {
        AgentError::ToolValidation("tool arguments must be a JSON object".to_string())
    })?;

    let Some(schema_object) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_object.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(AgentError::ToolValidation(format!(
                    "missing required argument '{key}'"
                )));
            }
        }
    }

    let properties = schema_object
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (key, value) in object {
        let Some(type_name) = properties
            .get(key)
            .and_then(|property| property.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let is_valid = match type_name {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !is_valid {
            return Err(AgentError::ToolValidation(format!(
                "argument '{key}' expected type '{type_name}'"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferedEventEmitter;

    fn echo_tool() -> RegisteredTool {
        let executor: ToolExecutor = Arc::new(|args, _context| {
            Box::pin(async move {
                Ok(args
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or("missing")
                    .to_string())
            })
        });
        RegisteredTool {
            definition: ToolDefinition {
                name: "echo".to_string(),
                description: "echo".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "required": ["value"],
                    "properties": { "value": { "type": "string" } }
                }),
            },
            executor,
        }
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCallData {
        ToolCallData {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn options(signal: AbortSignal) -> ToolDispatchOptions {
        ToolDispatchOptions {
            session_id: "s1".to_string(),
            signal,
            max_output_chars: 1_000,
        }
    }

    #[test]
    fn tool_registry_definitions_are_sorted_by_name() {
        let mut registry = ToolRegistry::default();
        let mut second = echo_tool();
        second.definition.name = "alpha".to_string();
        registry.register(echo_tool());
        registry.register(second);
        assert_eq!(registry.names(), vec!["alpha", "echo"]);
        assert_eq!(registry.definitions()[0].name, "alpha");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dispatch_turns_failures_into_error_results_in_call_order() {
        let mut registry = ToolRegistry::default();
        registry.register(echo_tool());
        let emitter = Arc::new(BufferedEventEmitter::default());

        let results = registry
            .dispatch(
                vec![
                    call("c1", "echo", serde_json::json!({ "value": "hi" })),
                    call("c2", "missing", serde_json::json!({})),
                    call("c3", "echo", serde_json::json!({ "value": 3 })),
                ],
                emitter.clone(),
                options(AbortSignal::new()),
            )
            .await
            .expect("dispatch should succeed");

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].text(), "hi");
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
        assert!(results[1].text().contains("Unknown tool"));
        assert!(results[2].is_error);
        assert_eq!(results[2].tool_call_id.as_deref(), Some("c3"));
        assert_eq!(
            emitter.kinds(),
            vec![
                EventKind::ToolCallStart,
                EventKind::ToolCallEnd,
                EventKind::ToolCallStart,
                EventKind::ToolCallEnd,
                EventKind::ToolCallStart,
                EventKind::ToolCallEnd,
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dispatch_after_abort_skips_execution() {
        let mut registry = ToolRegistry::default();
        registry.register(echo_tool());
        let signal = AbortSignal::new();
        signal.abort();

        let results = registry
            .dispatch(
                vec![call("c1", "echo", serde_json::json!({ "value": "hi" }))],
                Arc::new(crate::NoopEventEmitter),
                options(signal),
            )
            .await
            .expect("dispatch should succeed");
        assert!(results[0].is_error);
        assert_eq!(results[0].text(), "Tool execution aborted");
    }
}
