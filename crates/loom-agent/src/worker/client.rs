//! Worker side of the proxy protocol: outbound calls awaiting parent results.

use super::protocol::{ProxyCall, ProxyCancel, ProxyCapability, ProxyResult, WorkerMessage};
use crate::{WorkerConfig, WorkerError};
use dashmap::DashMap;
use loom_llm::AbortSignal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

type PendingReply = oneshot::Sender<Result<Value, WorkerError>>;

struct PendingCall {
    capability: ProxyCapability,
    reply: PendingReply,
}

/// Issues proxy calls to the parent and resolves them as results arrive.
#[derive(Clone)]
pub struct WorkerClient {
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    pending: Arc<DashMap<String, PendingCall>>,
    config: WorkerConfig,
}

impl WorkerClient {
    pub fn new(outbound: mpsc::UnboundedSender<WorkerMessage>, config: WorkerConfig) -> Self {
        Self {
            outbound,
            pending: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a call and wait for its result, an abort, or the call timeout.
    ///
    /// An interpreter call that is abandoned through abort or timeout sends
    /// `python_cancel` so the parent stops working on it.
    pub async fn call(
        &self,
        capability: ProxyCapability,
        tool_name: &str,
        arguments: Value,
        signal: &AbortSignal,
    ) -> Result<Value, WorkerError> {
        let call_id = Uuid::new_v4().to_string();
        if signal.is_aborted() {
            return Err(WorkerError::Cancelled { call_id });
        }

        let (reply, response) = oneshot::channel();
        self.pending.insert(call_id.clone(), PendingCall { capability, reply });
        let message = WorkerMessage::call(
            capability,
            ProxyCall {
                call_id: call_id.clone(),
                tool_name: tool_name.to_string(),
                arguments,
            },
        );
        if self.outbound.send(message).is_err() {
            self.pending.remove(&call_id);
            return Err(WorkerError::ChannelClosed);
        }
        debug!(call_id = %call_id, tool = tool_name, capability = capability.as_str(), "proxy call sent");

        let timeout_ms = self.config.call_timeout_ms;
        tokio::select! {
            reply = response => match reply {
                Ok(result) => result,
                Err(_) => Err(WorkerError::ChannelClosed),
            },
            _ = signal.aborted() => {
                self.abandon(&call_id);
                Err(WorkerError::Cancelled { call_id })
            }
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                warn!(call_id = %call_id, timeout_ms, "proxy call timed out");
                self.abandon(&call_id);
                Err(WorkerError::TimedOut { call_id, timeout_ms })
            }
        }
    }

    /// Deliver a parent result to its waiting call. Returns false when no call
    /// with that id is outstanding.
    pub fn resolve(&self, result: ProxyResult) -> bool {
        let Some((call_id, pending)) = self.pending.remove(&result.call_id) else {
            warn!(call_id = %result.call_id, "result for unknown proxy call");
            return false;
        };
        debug!(call_id = %call_id, "proxy call resolved");
        pending.reply.send(result.into_result()).is_ok()
    }

    /// The parent cancelled one outstanding call.
    pub fn cancel(&self, call_id: &str) -> bool {
        let Some((call_id, pending)) = self.pending.remove(call_id) else {
            return false;
        };
        pending
            .reply
            .send(Err(WorkerError::Cancelled { call_id }))
            .is_ok()
    }

    /// Fail every outstanding call as cancelled.
    pub fn cancel_all(&self) {
        let call_ids: Vec<String> = self.pending.iter().map(|item| item.key().clone()).collect();
        for call_id in call_ids {
            self.cancel(&call_id);
        }
    }

    fn abandon(&self, call_id: &str) {
        let Some((call_id, pending)) = self.pending.remove(call_id) else {
            return;
        };
        if pending.capability.is_cancellable() {
            let _ = self
                .outbound
                .send(WorkerMessage::PythonCancel(ProxyCancel { call_id }));
        }
    }
}
