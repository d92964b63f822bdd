//! Isolated agent loop running on the same runtime as its parent.

use super::client::WorkerClient;
use super::protocol::{
    ProxyCapability, ProxyToolSpec, WorkerChannel, WorkerDone, WorkerMessage,
    WorkerStartPayload, worker_channel,
};
use super::router::{ParentRouter, ProxyHandler, ProxyHandlers};
use crate::{
    AgentError, EventEmitter, PromptStatus, RegisteredTool, Session, SessionConfig, SessionEvent,
    TaskBackend, TaskResult, TaskSpec, ToolContext, ToolExecutor, ToolRegistry, WorkerConfig,
};
use async_trait::async_trait;
use loom_llm::{CompletionTransport, ToolDefinition};
use loom_store::{MemoryEntryStore, SessionHeader};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Forwards a worker session's events to the parent as `event` messages.
pub struct ProtocolEventEmitter {
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl ProtocolEventEmitter {
    pub fn new(sender: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { sender }
    }
}

impl EventEmitter for ProtocolEventEmitter {
    fn emit(&self, event: SessionEvent) -> Result<(), AgentError> {
        let _ = self.sender.send(WorkerMessage::Event { event });
        Ok(())
    }
}

fn proxy_tool(client: WorkerClient, spec: ProxyToolSpec) -> RegisteredTool {
    let capability = spec.capability;
    let name = spec.definition.name.clone();
    let executor: ToolExecutor = Arc::new(move |arguments, context: ToolContext| {
        let client = client.clone();
        let name = name.clone();
        Box::pin(async move {
            let value = client
                .call(capability, &name, arguments, &context.signal)
                .await?;
            Ok(match value {
                Value::String(text) => text,
                other => other.to_string(),
            })
        })
    });
    RegisteredTool {
        definition: spec.definition,
        executor,
    }
}

fn failed_done(started: Instant, error: impl Into<String>) -> WorkerMessage {
    WorkerMessage::Done(WorkerDone {
        exit_code: 1,
        duration_ms: started.elapsed().as_millis() as u64,
        error: Some(error.into()),
        ..WorkerDone::default()
    })
}

/// Serve the worker end of a channel: wait for `start`, run the task in a fresh
/// in-memory session whose tools are proxied to the parent, then send `done`.
pub async fn run_worker(
    transport: Arc<dyn CompletionTransport>,
    channel: WorkerChannel,
    config: WorkerConfig,
) {
    let WorkerChannel {
        sender,
        mut receiver,
    } = channel;
    let started = Instant::now();

    let payload = match receiver.recv().await {
        Some(WorkerMessage::Start(payload)) => payload,
        Some(other) => {
            let _ = sender.send(failed_done(
                started,
                format!("expected start, got {}", other.type_name()),
            ));
            return;
        }
        None => return,
    };

    let client = WorkerClient::new(sender.clone(), config);
    let mut registry = ToolRegistry::default();
    for spec in payload.tools {
        registry.register(proxy_tool(client.clone(), spec));
    }
    let session_config = SessionConfig {
        model: payload.model,
        provider: payload.provider,
        api_key: payload.api_key,
        system_prompt: payload.system_prompt,
        thinking_level: payload.thinking_level,
        ..SessionConfig::default()
    };
    let store = Arc::new(MemoryEntryStore::with_header(
        SessionHeader::new().with_parent_session(payload.parent_session_id),
    ));
    let session = Session::builder(transport, store)
        .config(session_config)
        .tools(registry)
        .emitter(Arc::new(ProtocolEventEmitter::new(sender.clone())))
        .build()
        .await;
    let session = match session {
        Ok(session) => Arc::new(session),
        Err(error) => {
            let _ = sender.send(failed_done(started, error.to_string()));
            return;
        }
    };

    let pump = {
        let session = session.clone();
        let client = client.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let Err(error) = message.validate() {
                    warn!(error = %error, "dropping invalid parent message");
                    continue;
                }
                match message {
                    WorkerMessage::Abort => {
                        debug!("worker received abort");
                        session.abort();
                    }
                    WorkerMessage::McpResult(result)
                    | WorkerMessage::PythonResult(result)
                    | WorkerMessage::LspResult(result) => {
                        client.resolve(result);
                    }
                    WorkerMessage::PythonCancel(cancel) => {
                        client.cancel(&cancel.call_id);
                    }
                    other => warn!(kind = other.type_name(), "unexpected message from parent"),
                }
            }
            session.abort();
            client.cancel_all();
        })
    };

    let outcome = session.prompt(&payload.task).await;
    let tokens = session
        .stats()
        .await
        .map(|stats| stats.usage.total_tokens)
        .unwrap_or_default();
    let done = match outcome {
        Ok(outcome) => {
            let aborted = outcome.status == PromptStatus::Aborted;
            WorkerDone {
                exit_code: if aborted { 1 } else { 0 },
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
                aborted,
                output: outcome
                    .last_message
                    .map(|message| message.text())
                    .unwrap_or_default(),
                tokens,
            }
        }
        Err(error) => WorkerDone {
            exit_code: 1,
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(error.to_string()),
            tokens,
            ..WorkerDone::default()
        },
    };

    if let Err(error) = session.dispose().await {
        warn!(error = %error, "worker session did not close cleanly");
    }
    client.cancel_all();
    pump.abort();
    let _ = sender.send(WorkerMessage::Done(done));
}

/// Runs delegated tasks as in-process workers behind a [`ParentRouter`].
#[derive(Clone)]
pub struct InProcessBackend {
    transport: Arc<dyn CompletionTransport>,
    session: SessionConfig,
    worker: WorkerConfig,
    handlers: ProxyHandlers,
    tools: Vec<ProxyToolSpec>,
}

impl InProcessBackend {
    /// `session` supplies the model settings every worker inherits.
    pub fn new(transport: Arc<dyn CompletionTransport>, session: SessionConfig) -> Self {
        Self {
            transport,
            session,
            worker: WorkerConfig::default(),
            handlers: ProxyHandlers::default(),
            tools: Vec::new(),
        }
    }

    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Expose `tools` to workers, served by `handler` on the parent.
    pub fn with_proxy(
        mut self,
        capability: ProxyCapability,
        handler: Arc<dyn ProxyHandler>,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        self.handlers = self.handlers.with(capability, handler);
        self.tools.extend(
            tools
                .into_iter()
                .map(|definition| ProxyToolSpec {
                    capability,
                    definition,
                }),
        );
        self
    }

    fn start_payload(&self, spec: &TaskSpec, parent_session_id: &str) -> WorkerStartPayload {
        WorkerStartPayload {
            parent_session_id: parent_session_id.to_string(),
            task: spec.task.clone(),
            model: spec
                .model
                .clone()
                .unwrap_or_else(|| self.session.model.clone()),
            provider: self.session.provider.clone(),
            api_key: self.session.api_key.clone(),
            system_prompt: spec
                .system_prompt
                .clone()
                .or_else(|| self.session.system_prompt.clone()),
            thinking_level: self.session.thinking_level.clone(),
            tools: self.tools.clone(),
        }
    }
}

#[async_trait]
impl TaskBackend for InProcessBackend {
    async fn run_task(&self, index: usize, spec: TaskSpec, context: ToolContext) -> TaskResult {
        let started = Instant::now();
        let (parent, worker) = worker_channel();
        if parent
            .sender
            .send(WorkerMessage::Start(self.start_payload(&spec, &context.session_id)))
            .is_err()
        {
            return TaskResult::failed(index, &spec.task, "worker channel closed");
        }

        let worker_task = tokio::spawn(run_worker(
            self.transport.clone(),
            worker,
            self.worker.clone(),
        ));
        let router = ParentRouter::new(
            context.session_id.clone(),
            self.handlers.clone(),
            context.emitter.clone(),
            self.worker.clone(),
        );
        let outcome = router.run(parent, context.signal.clone()).await;
        // Past `done` the worker has nothing left to do; past the abort grace
        // period it is abandoned.
        worker_task.abort();

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(done) => TaskResult {
                index,
                task: spec.task,
                exit_code: Some(done.exit_code),
                output: done.output,
                truncated: false,
                duration_ms,
                tokens: done.tokens,
                cancelled: done.aborted,
                error: done.error,
            },
            Err(error) => TaskResult {
                duration_ms,
                ..TaskResult::failed(index, &spec.task, error.to_string())
            },
        }
    }
}
