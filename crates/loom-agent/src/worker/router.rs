//! Parent side of the worker protocol.

use super::protocol::{
    ProxyCall, ProxyCancel, ProxyCapability, ProxyResult, WorkerChannel, WorkerDone,
    WorkerMessage,
};
use crate::{EventEmitter, ToolContext, ToolRegistry, WorkerConfig, WorkerError};
use async_trait::async_trait;
use dashmap::DashMap;
use loom_llm::AbortSignal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-call context handed to a [`ProxyHandler`].
#[derive(Clone, Debug)]
pub struct ProxyContext {
    pub call_id: String,
    pub capability: ProxyCapability,
    /// Aborted when the worker cancels this call or the parent aborts the worker.
    pub signal: AbortSignal,
}

/// Executes proxied calls against a real parent capability.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn handle(&self, call: ProxyCall, context: ProxyContext) -> Result<Value, String>;
}

#[derive(Clone, Default)]
pub struct ProxyHandlers {
    handlers: HashMap<ProxyCapability, Arc<dyn ProxyHandler>>,
}

impl ProxyHandlers {
    pub fn with(mut self, capability: ProxyCapability, handler: Arc<dyn ProxyHandler>) -> Self {
        self.handlers.insert(capability, handler);
        self
    }

    pub fn get(&self, capability: ProxyCapability) -> Option<Arc<dyn ProxyHandler>> {
        self.handlers.get(&capability).cloned()
    }
}

/// Serves proxied calls out of a parent [`ToolRegistry`].
pub struct RegistryProxyHandler {
    registry: Arc<ToolRegistry>,
    session_id: String,
    emitter: Arc<dyn EventEmitter>,
}

impl RegistryProxyHandler {
    pub fn new(
        registry: Arc<ToolRegistry>,
        session_id: impl Into<String>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
            emitter,
        }
    }
}

#[async_trait]
impl ProxyHandler for RegistryProxyHandler {
    async fn handle(&self, call: ProxyCall, context: ProxyContext) -> Result<Value, String> {
        let tool_context = ToolContext {
            session_id: self.session_id.clone(),
            call_id: context.call_id,
            signal: context.signal,
            emitter: self.emitter.clone(),
        };
        self.registry
            .execute(&call.tool_name, call.arguments, tool_context)
            .await
            .map(Value::String)
            .map_err(|error| error.to_string())
    }
}

struct InFlight {
    capability: ProxyCapability,
    signal: AbortSignal,
}

/// Correlates a worker's proxy calls with parent capabilities until `done`.
///
/// Every call that is not cancelled receives exactly one result. A call is
/// removed from the in-flight map by whichever side finishes it first (its
/// handler, a `python_cancel`, or a parent abort), and only that side may answer.
pub struct ParentRouter {
    session_id: String,
    handlers: ProxyHandlers,
    emitter: Arc<dyn EventEmitter>,
    config: WorkerConfig,
    in_flight: Arc<DashMap<String, InFlight>>,
}

impl ParentRouter {
    pub fn new(
        session_id: impl Into<String>,
        handlers: ProxyHandlers,
        emitter: Arc<dyn EventEmitter>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            handlers,
            emitter,
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Pump the parent end of `channel` until the worker reports `done`.
    ///
    /// When `signal` fires the worker is sent `abort` and every outstanding call
    /// is released. If no `done` arrives within the abort grace period the run
    /// ends with an aborted result of its own.
    pub async fn run(
        &self,
        channel: WorkerChannel,
        signal: AbortSignal,
    ) -> Result<WorkerDone, WorkerError> {
        let WorkerChannel {
            sender,
            mut receiver,
        } = channel;
        let started = Instant::now();
        let mut abort_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(message) = message else {
                        self.release_all(&sender);
                        warn!("worker channel closed before done");
                        return Err(WorkerError::ChannelClosed);
                    };
                    if let Some(done) = self.route(message, &sender) {
                        self.release_all(&sender);
                        info!(exit_code = done.exit_code, aborted = done.aborted, "worker finished");
                        return Ok(done);
                    }
                }
                _ = signal.aborted(), if abort_deadline.is_none() => {
                    info!(in_flight = self.in_flight.len(), "aborting worker");
                    let _ = sender.send(WorkerMessage::Abort);
                    self.release_all(&sender);
                    abort_deadline =
                        Some(Instant::now() + Duration::from_millis(self.config.abort_grace_ms));
                }
                _ = wait_until(abort_deadline) => {
                    warn!("worker did not finish within the abort grace period");
                    return Ok(WorkerDone {
                        exit_code: 1,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some("worker did not acknowledge abort".to_string()),
                        aborted: true,
                        ..WorkerDone::default()
                    });
                }
            }
        }
    }

    /// Handle one inbound message. Returns the terminal payload on `done`.
    fn route(
        &self,
        message: WorkerMessage,
        sender: &mpsc::UnboundedSender<WorkerMessage>,
    ) -> Option<WorkerDone> {
        if let Err(error) = message.validate() {
            warn!(error = %error, "dropping invalid worker message");
            return None;
        }
        match message {
            WorkerMessage::McpCall(call) => self.dispatch(ProxyCapability::Mcp, call, sender),
            WorkerMessage::PythonCall(call) => {
                self.dispatch(ProxyCapability::Python, call, sender)
            }
            WorkerMessage::LspCall(call) => self.dispatch(ProxyCapability::Lsp, call, sender),
            WorkerMessage::PythonCancel(ProxyCancel { call_id }) => {
                if let Some((_, call)) = self.in_flight.remove(&call_id) {
                    debug!(call_id = %call_id, "worker cancelled proxy call");
                    call.signal.abort();
                }
            }
            WorkerMessage::Event { event } => {
                let _ = self.emitter.emit(event);
            }
            WorkerMessage::Done(done) => return Some(done),
            other => {
                warn!(kind = other.type_name(), "unexpected message from worker");
            }
        }
        None
    }

    fn dispatch(
        &self,
        capability: ProxyCapability,
        call: ProxyCall,
        sender: &mpsc::UnboundedSender<WorkerMessage>,
    ) {
        if self.in_flight.contains_key(&call.call_id) {
            warn!(call_id = %call.call_id, "dropping duplicate proxy call id");
            return;
        }
        let Some(handler) = self.handlers.get(capability) else {
            let _ = sender.send(WorkerMessage::result(
                capability,
                ProxyResult::err(
                    call.call_id,
                    format!("{} is not available to this worker", capability.as_str()),
                ),
            ));
            return;
        };

        let signal = AbortSignal::new();
        self.in_flight.insert(
            call.call_id.clone(),
            InFlight {
                capability,
                signal: signal.clone(),
            },
        );
        debug!(
            session_id = %self.session_id,
            call_id = %call.call_id,
            tool = %call.tool_name,
            capability = capability.as_str(),
            "routing proxy call"
        );

        let in_flight = self.in_flight.clone();
        let sender = sender.clone();
        let context = ProxyContext {
            call_id: call.call_id.clone(),
            capability,
            signal,
        };
        tokio::spawn(async move {
            let call_id = call.call_id.clone();
            let outcome = handler.handle(call, context).await;
            // A cancel or abort may have claimed the call while it ran.
            if in_flight.remove(&call_id).is_none() {
                return;
            }
            let result = match outcome {
                Ok(value) => ProxyResult::ok(call_id, value),
                Err(error) => ProxyResult::err(call_id, error),
            };
            let _ = sender.send(WorkerMessage::result(capability, result));
        });
    }

    /// Claim every outstanding call: interpreter calls are cancelled, the rest
    /// are answered with an error so no call is left without a terminal response.
    fn release_all(&self, sender: &mpsc::UnboundedSender<WorkerMessage>) {
        let call_ids: Vec<String> = self.in_flight.iter().map(|item| item.key().clone()).collect();
        for call_id in call_ids {
            let Some((call_id, call)) = self.in_flight.remove(&call_id) else {
                continue;
            };
            call.signal.abort();
            let message = if call.capability.is_cancellable() {
                WorkerMessage::PythonCancel(ProxyCancel { call_id })
            } else {
                WorkerMessage::result(call.capability, ProxyResult::err(call_id, "aborted"))
            };
            let _ = sender.send(message);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
