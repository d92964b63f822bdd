#![allow(dead_code)]

use async_trait::async_trait;
use loom_agent::{
    RegisteredTool, Session, SessionConfig, SessionEvent, ToolExecutor, ToolRegistry,
};
use loom_llm::{
    CompletionOptions, CompletionTransport, ContentPart, Message, Request, Response, SDKError,
    StopReason, ToolCallData, ToolDefinition, Usage,
};
use loom_store::{EntryStore, MemoryEntryStore};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub enum Scripted {
    Reply(Response),
    Fail(SDKError),
    /// Hold the completion open until the gate is notified. An abort releases
    /// it early with an aborted partial reply.
    Gated(Arc<Notify>, Response),
}

#[derive(Clone, Default)]
pub struct SequenceTransport {
    pub responses: Arc<Mutex<VecDeque<Scripted>>>,
    pub requests: Arc<Mutex<Vec<Request>>>,
}

impl SequenceTransport {
    pub fn new(responses: Vec<Scripted>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn replies(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|text| Scripted::Reply(text_response(text)))
                .collect(),
        )
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("requests mutex").clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("responses mutex").len()
    }
}

#[async_trait]
impl CompletionTransport for SequenceTransport {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn complete(
        &self,
        request: Request,
        options: CompletionOptions,
    ) -> Result<Response, SDKError> {
        self.requests.lock().expect("requests mutex").push(request);
        let next = self.responses.lock().expect("responses mutex").pop_front();
        match next {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Gated(gate, response)) => tokio::select! {
                _ = gate.notified() => Ok(response),
                _ = options.signal.aborted() => Ok(Response {
                    stop_reason: StopReason::Aborted,
                    ..text_response("partial")
                }),
            },
            None => Err(SDKError::configuration("no response queued")),
        }
    }
}

pub fn text_response(text: &str) -> Response {
    Response {
        message: Message::assistant(text),
        stop_reason: StopReason::Stop,
        usage: Usage {
            input_tokens: 20,
            output_tokens: 5,
            total_tokens: 25,
            ..Usage::default()
        },
        error_message: None,
    }
}

pub fn tool_call_response(call_id: &str, name: &str, arguments: Value) -> Response {
    Response {
        message: Message::assistant_parts(
            vec![ContentPart::tool_call(ToolCallData {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments,
            })],
            StopReason::ToolUse,
        ),
        stop_reason: StopReason::ToolUse,
        usage: Usage::default(),
        error_message: None,
    }
}

pub fn tool_result_text(session_messages: &[Message], call_id: &str) -> Option<String> {
    session_messages
        .iter()
        .find(|message| message.tool_call_id.as_deref() == Some(call_id))
        .map(Message::text)
}

pub fn echo_tool(name: &str) -> RegisteredTool {
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
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: serde_json::json!({
                "type": "object",
                "required": ["value"],
                "properties": { "value": { "type": "string" } }
            }),
        },
        executor,
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig::default()
        .with_model("test-model")
        .with_auto_prune(false)
        .with_abort_grace_ms(200)
}

pub async fn session_with(
    transport: SequenceTransport,
    store: Arc<dyn EntryStore>,
    tools: ToolRegistry,
) -> Arc<Session> {
    Arc::new(
        Session::builder(Arc::new(transport), store)
            .config(test_config())
            .tools(tools)
            .build()
            .await
            .expect("session should build"),
    )
}

pub async fn memory_session(transport: SequenceTransport) -> Arc<Session> {
    session_with(transport, Arc::new(MemoryEntryStore::new()), ToolRegistry::default()).await
}

pub async fn wait_for_streaming(session: &Session) {
    for _ in 0..1_000 {
        if session.is_streaming() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("session never started streaming");
}

pub fn event_strings(events: &[SessionEvent], key: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| event.get_str(key).map(str::to_string))
        .collect()
}
