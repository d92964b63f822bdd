use crate::{
    AgentError, ConcurrencyError, EventEmitter, EventKind, NoopEventEmitter, PruneResult,
    SessionConfig, SessionError, SessionEvent, ToolRegistry, estimate_messages_tokens, event_data,
    prune_branch,
};
use loom_llm::{AbortSignal, CompletionTransport, ContentPart, Message, Usage};
use loom_store::{EntryIndex, EntryKind, EntryStore, SessionEntry, branch_path};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

mod branch;
mod context;
mod turn;
mod types;

pub use context::{context_messages, conversation_messages};
pub use types::{
    BranchOutcome, PromptOptions, PromptOutcome, PromptStatus, QueueKind, QueuedMessage,
    SessionState, SessionStats, StreamingBehavior, UserMessageRef,
};

struct SessionInner {
    state: SessionState,
    queue: VecDeque<QueuedMessage>,
    /// Signal of the running stream or branch summarization.
    active_signal: Option<AbortSignal>,
    navigating: bool,
    model: String,
    provider: Option<String>,
    thinking_level: Option<String>,
    usage: Usage,
}

/// One branching conversation and the single completion in flight against it.
///
/// Every operation takes `&self`; share a session across tasks with `Arc`.
/// `steer`, `follow_up` and `abort` never wait, `prompt` is the only operation
/// that suspends on the transport, and `branch` waits for an active stream to
/// settle before it moves the leaf.
pub struct Session {
    id: String,
    transport: Arc<dyn CompletionTransport>,
    store: Arc<dyn EntryStore>,
    tools: ToolRegistry,
    event_emitter: Arc<dyn EventEmitter>,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    /// Parent of every stream signal; aborted on dispose.
    root_signal: AbortSignal,
    /// Held for the whole of a stream, a branch summarization or an entry append.
    flight: tokio::sync::Mutex<()>,
}

pub struct SessionBuilder {
    transport: Arc<dyn CompletionTransport>,
    store: Arc<dyn EntryStore>,
    config: SessionConfig,
    tools: ToolRegistry,
    event_emitter: Arc<dyn EventEmitter>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn emitter(mut self, event_emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = event_emitter;
        self
    }

    /// Open the session over its store. Model and thinking-level changes
    /// recorded on the current branch override the configured defaults.
    pub async fn build(self) -> Result<Session, AgentError> {
        let header = self.store.header().await?;
        let entries = self.store.entries().await?;
        let leaf = self.store.leaf().await?;

        let mut model = self.config.model.clone();
        let mut provider = self.config.provider.clone();
        let mut thinking_level = self.config.thinking_level.clone();
        for index in branch_path(&entries, leaf) {
            match &entries[index].kind {
                EntryKind::ModelChange {
                    provider: changed_provider,
                    model: changed_model,
                } => {
                    model = changed_model.clone();
                    provider = changed_provider.clone().or(provider);
                }
                EntryKind::ThinkingLevelChange { level } => thinking_level = Some(level.clone()),
                _ => {}
            }
        }
        if model.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "session requires a model".to_string(),
            ));
        }

        let session = Session {
            id: header.id,
            transport: self.transport,
            store: self.store,
            tools: self.tools,
            event_emitter: self.event_emitter,
            config: self.config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                queue: VecDeque::new(),
                active_signal: None,
                navigating: false,
                model,
                provider,
                thinking_level,
                usage: Usage::default(),
            }),
            root_signal: AbortSignal::new(),
            flight: tokio::sync::Mutex::new(()),
        };
        let model = session.model();
        info!(session_id = %session.id, model = %model, entries = entries.len(), "session opened");
        session.emit(
            EventKind::SessionStart,
            serde_json::json!({ "model": model, "entries": entries.len() }),
        )?;
        Ok(session)
    }
}

impl Session {
    pub fn builder(
        transport: Arc<dyn CompletionTransport>,
        store: Arc<dyn EntryStore>,
    ) -> SessionBuilder {
        SessionBuilder {
            transport,
            store,
            config: SessionConfig::default(),
            tools: ToolRegistry::default(),
            event_emitter: Arc::new(NoopEventEmitter),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    pub fn model(&self) -> String {
        self.lock().model.clone()
    }

    pub fn thinking_level(&self) -> Option<String> {
        self.lock().thinking_level.clone()
    }

    pub fn usage(&self) -> Usage {
        self.lock().usage.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, kind: EventKind, data: Value) -> Result<(), AgentError> {
        self.event_emitter
            .emit(SessionEvent::new(kind, self.id.clone(), event_data(data)))
    }

    fn transition(inner: &mut SessionInner, next: SessionState) -> Result<(), AgentError> {
        if !inner.state.can_transition_to(&next) {
            return Err(SessionError::InvalidStateTransition {
                from: inner.state.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        inner.state = next;
        Ok(())
    }

    /// Queue a message for delivery at the next turn boundary. Never fails
    /// because a stream is active.
    pub fn steer(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.enqueue(QueueKind::Steer, text.into())
    }

    /// Queue a message for delivery once the agent finishes its current work.
    pub fn follow_up(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.enqueue(QueueKind::FollowUp, text.into())
    }

    fn enqueue(&self, kind: QueueKind, text: String) -> Result<(), AgentError> {
        let pending = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return Err(AgentError::session_closed());
            }
            inner.queue.push_back(QueuedMessage {
                kind,
                text: text.clone(),
            });
            inner.queue.len()
        };
        debug!(session_id = %self.id, ?kind, pending, "message queued");
        self.emit(
            EventKind::MessageQueued,
            serde_json::json!({ "kind": kind, "text": text, "pending": pending }),
        )
    }

    pub fn pending_messages(&self) -> Vec<QueuedMessage> {
        self.lock().queue.iter().cloned().collect()
    }

    /// Empty the queue and return what it held.
    pub fn clear_queue(&self) -> Vec<QueuedMessage> {
        self.lock().queue.drain(..).collect()
    }

    /// Pop the next queued message. With `only`, stop at the first message of
    /// another kind so delivery stays in call order.
    fn next_queued(&self, only: Option<QueueKind>) -> Option<QueuedMessage> {
        let mut inner = self.lock();
        match (only, inner.queue.front()) {
            (Some(kind), Some(front)) if front.kind != kind => None,
            _ => inner.queue.pop_front(),
        }
    }

    /// Signal cancellation to the active stream or branch summarization.
    pub fn abort(&self) {
        let signal = self.lock().active_signal.clone();
        if let Some(signal) = signal {
            info!(session_id = %self.id, "abort requested");
            signal.abort();
        }
    }

    /// Close the session: cancel any stream and outstanding tool or worker
    /// calls, drop the queue, and wait up to the abort grace period for the
    /// stream to settle.
    pub async fn dispose(&self) -> Result<(), AgentError> {
        {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return Ok(());
            }
            Self::transition(&mut inner, SessionState::Closed)?;
            inner.queue.clear();
        }
        self.root_signal.abort();
        let grace = Duration::from_millis(self.config.abort_grace_ms);
        if tokio::time::timeout(grace, self.flight.lock()).await.is_err() {
            warn!(session_id = %self.id, "stream did not settle before dispose");
        }
        info!(session_id = %self.id, "session closed");
        self.emit(EventKind::SessionEnd, serde_json::json!({}))
    }

    /// Entries from the root to the current leaf.
    pub async fn branch_entries(&self) -> Result<Vec<SessionEntry>, AgentError> {
        let entries = self.store.entries().await?;
        let leaf = self.store.leaf().await?;
        Ok(branch_path(&entries, leaf)
            .into_iter()
            .map(|index| entries[index].clone())
            .collect())
    }

    /// Conversational view of the current branch.
    pub async fn messages(&self) -> Result<Vec<Message>, AgentError> {
        Ok(conversation_messages(&self.branch_entries().await?))
    }

    /// The messages the next completion would send.
    pub async fn context_messages(&self) -> Result<Vec<Message>, AgentError> {
        Ok(context_messages(&self.branch_entries().await?))
    }

    /// Every user turn on the current branch, in order.
    pub async fn get_user_messages_for_branching(
        &self,
    ) -> Result<Vec<UserMessageRef>, AgentError> {
        Ok(self
            .branch_entries()
            .await?
            .iter()
            .filter(|entry| context::is_user_message(entry))
            .filter_map(|entry| {
                entry.message().map(|message| UserMessageRef {
                    index: entry.index,
                    text: message.text(),
                })
            })
            .collect())
    }

    /// Append an entry at the leaf and advance the leaf to it.
    async fn append_at_leaf(&self, kind: EntryKind) -> Result<SessionEntry, AgentError> {
        let leaf = self.store.leaf().await?;
        let entry = self.store.append(leaf, kind).await?;
        self.store.set_leaf(Some(entry.index)).await?;
        Ok(entry)
    }

    /// Append outside a stream. Fails instead of waiting when a stream or a
    /// navigation holds the session.
    async fn append_idle(&self, kind: EntryKind) -> Result<SessionEntry, AgentError> {
        {
            let inner = self.lock();
            match inner.state {
                SessionState::Closed => return Err(AgentError::session_closed()),
                SessionState::Streaming => {
                    return Err(ConcurrencyError::AppendWhileStreaming.into());
                }
                SessionState::Idle if inner.navigating => {
                    return Err(ConcurrencyError::NavigationInProgress.into());
                }
                SessionState::Idle => {}
            }
        }
        let _flight = self
            .flight
            .try_lock()
            .map_err(|_| AgentError::from(ConcurrencyError::AppendWhileStreaming))?;
        self.append_at_leaf(kind).await
    }

    pub async fn set_model(
        &self,
        model: impl Into<String>,
        provider: Option<String>,
    ) -> Result<SessionEntry, AgentError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(AgentError::Validation("model must not be empty".to_string()));
        }
        let entry = self
            .append_idle(EntryKind::ModelChange {
                provider: provider.clone(),
                model: model.clone(),
            })
            .await?;
        {
            let mut inner = self.lock();
            inner.model = model.clone();
            if provider.is_some() {
                inner.provider = provider.clone();
            }
        }
        self.emit(
            EventKind::ModelChanged,
            serde_json::json!({ "model": model, "provider": provider }),
        )?;
        Ok(entry)
    }

    pub async fn set_thinking_level(
        &self,
        level: impl Into<String>,
    ) -> Result<SessionEntry, AgentError> {
        let level = level.into();
        let entry = self
            .append_idle(EntryKind::ThinkingLevelChange {
                level: level.clone(),
            })
            .await?;
        self.lock().thinking_level = Some(level.clone());
        self.emit(
            EventKind::ThinkingLevelChanged,
            serde_json::json!({ "level": level }),
        )?;
        Ok(entry)
    }

    /// Inject content that did not come from the model into the conversation.
    pub async fn append_custom_message(
        &self,
        custom_type: impl Into<String>,
        content: Vec<ContentPart>,
        display: bool,
    ) -> Result<SessionEntry, AgentError> {
        self.append_idle(EntryKind::CustomMessage {
            custom_type: custom_type.into(),
            content,
            display,
        })
        .await
    }

    /// Record extension state that never reaches the model.
    pub async fn append_custom(
        &self,
        custom_type: impl Into<String>,
        data: Value,
    ) -> Result<SessionEntry, AgentError> {
        self.append_idle(EntryKind::Custom {
            custom_type: custom_type.into(),
            data,
        })
        .await
    }

    /// Label an entry; `None` clears an earlier label.
    pub async fn set_label(
        &self,
        target: EntryIndex,
        label: Option<String>,
    ) -> Result<SessionEntry, AgentError> {
        self.ensure_entry(target).await?;
        self.append_idle(EntryKind::Label { target, label }).await
    }

    /// Record a compaction boundary: context sent to the transport starts with
    /// `summary` followed by the branch from `first_kept_index` on.
    pub async fn append_compaction(
        &self,
        summary: impl Into<String>,
        first_kept_index: EntryIndex,
    ) -> Result<SessionEntry, AgentError> {
        let branch = self.branch_entries().await?;
        if !branch.iter().any(|entry| entry.index == first_kept_index) {
            return Err(SessionError::UnknownEntry(first_kept_index).into());
        }
        let tokens_before = estimate_messages_tokens(&context_messages(&branch));
        self.append_idle(EntryKind::Compaction {
            summary: summary.into(),
            first_kept_index,
            tokens_before,
        })
        .await
    }

    async fn ensure_entry(&self, index: EntryIndex) -> Result<(), AgentError> {
        let count = self.store.entries().await?.len();
        if index >= count {
            return Err(SessionError::UnknownEntry(index).into());
        }
        Ok(())
    }

    /// Run one pruning pass over the current branch and report it.
    async fn prune_pass(&self) -> Result<PruneResult, AgentError> {
        let branch = self.branch_entries().await?;
        let result = prune_branch(self.store.as_ref(), &branch, &self.config.prune).await?;
        if !result.is_noop() {
            self.emit(
                EventKind::Pruned,
                serde_json::json!({
                    "pruned_count": result.pruned_count,
                    "tokens_saved": result.tokens_saved,
                }),
            )?;
        }
        Ok(result)
    }

    /// Prune now, outside a stream.
    pub async fn prune_now(&self) -> Result<PruneResult, AgentError> {
        {
            let inner = self.lock();
            match inner.state {
                SessionState::Closed => return Err(AgentError::session_closed()),
                SessionState::Streaming => {
                    return Err(ConcurrencyError::AppendWhileStreaming.into());
                }
                SessionState::Idle => {}
            }
        }
        let _flight = self
            .flight
            .try_lock()
            .map_err(|_| AgentError::from(ConcurrencyError::AppendWhileStreaming))?;
        self.prune_pass().await
    }

    pub async fn stats(&self) -> Result<SessionStats, AgentError> {
        let entries = self.store.entries().await?;
        let leaf = self.store.leaf().await?;
        let branch: Vec<SessionEntry> = branch_path(&entries, leaf)
            .into_iter()
            .map(|index| entries[index].clone())
            .collect();

        let mut stats = SessionStats {
            session_id: self.id.clone(),
            entry_count: entries.len(),
            branch_length: branch.len(),
            context_tokens: estimate_messages_tokens(&context_messages(&branch)),
            usage: self.usage(),
            ..SessionStats::default()
        };
        for entry in &entries {
            *stats
                .entries_by_kind
                .entry(entry.kind.type_name().to_string())
                .or_default() += 1;
            match entry.role() {
                Some(loom_llm::Role::User) => stats.user_messages += 1,
                Some(loom_llm::Role::Assistant) => stats.assistant_messages += 1,
                Some(loom_llm::Role::ToolResult) => {
                    stats.tool_results += 1;
                    if entry.pruned_at().is_some() {
                        stats.pruned_tool_results += 1;
                    }
                }
                None => {}
            }
        }
        Ok(stats)
    }
}
