use super::*;
use crate::ToolDispatchOptions;
use loom_llm::{CompletionOptions, Request, SDKError, StopReason};

/// Returns the session to `Idle` when a stream ends on any path. The flight
/// lock is released only after the state is reset.
struct StreamGuard<'a> {
    session: &'a Session,
    _flight: Option<tokio::sync::MutexGuard<'a, ()>>,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.lock();
        inner.active_signal = None;
        if inner.state == SessionState::Streaming {
            inner.state = SessionState::Idle;
        }
    }
}

enum Admission {
    Queue(QueueKind),
    Run(AbortSignal),
}

enum TurnEnd {
    Completed(Option<Message>),
    Aborted(Option<Message>),
}

fn aborted_message() -> Message {
    Message::assistant_parts(Vec::new(), StopReason::Aborted)
}

impl Session {
    /// Run `text` as the next user turn, then any queued messages, until the
    /// agent stops. Fails with a concurrency error while a stream is active.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<PromptOutcome, AgentError> {
        self.prompt_with(text, PromptOptions::default()).await
    }

    /// Like [`Session::prompt`], but `options` may queue the text instead of
    /// failing when a stream is active.
    pub async fn prompt_with(
        &self,
        text: impl Into<String>,
        options: PromptOptions,
    ) -> Result<PromptOutcome, AgentError> {
        let text = text.into();
        let admission = {
            let mut inner = self.lock();
            match (inner.state, options.streaming_behavior) {
                (SessionState::Closed, _) => return Err(AgentError::session_closed()),
                (SessionState::Streaming, StreamingBehavior::Reject) => {
                    return Err(ConcurrencyError::PromptWhileStreaming.into());
                }
                (SessionState::Streaming, StreamingBehavior::Steer) => {
                    Admission::Queue(QueueKind::Steer)
                }
                (SessionState::Streaming, StreamingBehavior::FollowUp) => {
                    Admission::Queue(QueueKind::FollowUp)
                }
                (SessionState::Idle, _) if inner.navigating => {
                    return Err(ConcurrencyError::NavigationInProgress.into());
                }
                (SessionState::Idle, _) => {
                    Self::transition(&mut inner, SessionState::Streaming)?;
                    let signal = self.root_signal.child();
                    inner.active_signal = Some(signal.clone());
                    Admission::Run(signal)
                }
            }
        };
        let signal = match admission {
            Admission::Queue(kind) => {
                self.enqueue(kind, text)?;
                return Ok(PromptOutcome::queued());
            }
            Admission::Run(signal) => signal,
        };

        let mut guard = StreamGuard {
            session: self,
            _flight: None,
        };
        guard._flight = Some(self.flight.lock().await);
        info!(session_id = %self.id, "stream started");

        let outcome = self.run_inputs(text, &signal).await;
        match &outcome {
            Ok(outcome) => {
                info!(session_id = %self.id, status = ?outcome.status, turns = outcome.turns, "stream finished");
            }
            Err(error) => warn!(session_id = %self.id, error = %error, "stream failed"),
        }
        outcome
    }

    async fn run_inputs(
        &self,
        text: String,
        signal: &AbortSignal,
    ) -> Result<PromptOutcome, AgentError> {
        let mut turns = 0;
        let mut input = Some(text);
        let mut last_message = None;

        while let Some(text) = input.take() {
            self.append_user(text).await?;
            turns += 1;
            match self.run_turn(signal).await? {
                TurnEnd::Completed(message) => last_message = message,
                TurnEnd::Aborted(message) => {
                    self.emit(
                        EventKind::Aborted,
                        serde_json::json!({ "pending": self.pending_messages().len() }),
                    )?;
                    return Ok(PromptOutcome {
                        status: PromptStatus::Aborted,
                        turns,
                        last_message: message,
                    });
                }
            }
            if let Some(queued) = self.next_queued(None) {
                self.emit_delivery(&queued)?;
                input = Some(queued.text);
            }
        }

        Ok(PromptOutcome {
            status: PromptStatus::Completed,
            turns,
            last_message,
        })
    }

    async fn append_user(&self, text: String) -> Result<SessionEntry, AgentError> {
        let entry = self
            .append_at_leaf(EntryKind::message(Message::user(text.clone())))
            .await?;
        self.emit(
            EventKind::UserInput,
            serde_json::json!({ "index": entry.index, "text": text }),
        )?;
        Ok(entry)
    }

    fn emit_delivery(&self, queued: &QueuedMessage) -> Result<(), AgentError> {
        debug!(session_id = %self.id, kind = ?queued.kind, "delivering queued message");
        self.emit(
            EventKind::QueueDelivered,
            serde_json::json!({ "kind": queued.kind, "text": queued.text }),
        )
    }

    /// One user input: completions and tool rounds until the assistant stops.
    async fn run_turn(&self, signal: &AbortSignal) -> Result<TurnEnd, AgentError> {
        let mut rounds = 0;
        loop {
            if self.config.auto_prune {
                self.prune_pass().await?;
            }

            let message = self.complete(signal).await?;
            let entry = self
                .append_at_leaf(EntryKind::message(message.clone()))
                .await?;
            self.emit(
                EventKind::AssistantMessage,
                serde_json::json!({
                    "index": entry.index,
                    "text": message.text(),
                    "tool_calls": message.tool_calls().len(),
                    "stop_reason": message.stop_reason,
                }),
            )?;

            match message.stop_reason {
                Some(StopReason::Aborted) => return Ok(TurnEnd::Aborted(Some(message))),
                Some(StopReason::Error) => {
                    let error = message
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "completion failed".to_string());
                    self.emit(EventKind::Error, serde_json::json!({ "error": error }))?;
                    return Err(AgentError::Transport(error));
                }
                _ => {}
            }
            if signal.is_aborted() {
                return Ok(TurnEnd::Aborted(Some(message)));
            }

            let calls: Vec<_> = message.tool_calls().into_iter().cloned().collect();
            if calls.is_empty() {
                return Ok(TurnEnd::Completed(Some(message)));
            }

            let results = self
                .tools
                .dispatch(
                    calls,
                    self.event_emitter.clone(),
                    ToolDispatchOptions {
                        session_id: self.id.clone(),
                        signal: signal.clone(),
                        max_output_chars: self.config.tool_output_limit_chars,
                    },
                )
                .await?;
            for result in results {
                self.append_at_leaf(EntryKind::message(result)).await?;
            }
            if signal.is_aborted() {
                return Ok(TurnEnd::Aborted(Some(message)));
            }

            rounds += 1;
            if rounds >= self.config.max_tool_rounds_per_turn {
                warn!(session_id = %self.id, rounds, "tool round limit reached");
                self.emit(
                    EventKind::Warning,
                    serde_json::json!({ "message": "tool round limit reached", "rounds": rounds }),
                )?;
                return Ok(TurnEnd::Completed(Some(message)));
            }

            while let Some(queued) = self.next_queued(Some(QueueKind::Steer)) {
                self.emit_delivery(&queued)?;
                self.append_user(queued.text).await?;
            }
        }
    }

    async fn build_request(&self) -> Result<Request, AgentError> {
        let messages = self.context_messages().await?;
        let inner = self.lock();
        Ok(Request {
            model: inner.model.clone(),
            provider: inner.provider.clone(),
            system_prompt: self.config.system_prompt.clone(),
            messages,
            tools: self.tools.definitions(),
            reasoning_effort: inner.thinking_level.clone(),
        })
    }

    /// Call the transport once and normalize every way the call can end into
    /// an assistant message: aborts and provider failures included.
    ///
    /// After an abort the transport gets the grace period to return its partial
    /// message; past it the call is dropped and an empty aborted message stands
    /// in for it.
    async fn complete(&self, signal: &AbortSignal) -> Result<Message, AgentError> {
        let request = self.build_request().await?;
        if signal.is_aborted() {
            return Ok(aborted_message());
        }
        let options = CompletionOptions {
            api_key: self.config.api_key.clone(),
            signal: signal.clone(),
            max_tokens: self.config.max_tokens,
        };
        debug!(session_id = %self.id, model = %request.model, messages = request.messages.len(), "completion started");

        let call = self.transport.complete(request, options);
        tokio::pin!(call);
        let finished = tokio::select! {
            result = &mut call => Some(result),
            _ = signal.aborted() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                let grace = Duration::from_millis(self.config.abort_grace_ms);
                match tokio::time::timeout(grace, &mut call).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(session_id = %self.id, "transport ignored abort within grace period");
                        return Ok(aborted_message());
                    }
                }
            }
        };

        match result {
            Ok(response) => {
                {
                    let mut inner = self.lock();
                    inner.usage = inner.usage.clone() + response.usage.clone();
                }
                let mut message = response.message;
                message.stop_reason = Some(response.stop_reason);
                message.usage = Some(response.usage);
                if response.error_message.is_some() {
                    message.error_message = response.error_message;
                }
                Ok(message)
            }
            Err(SDKError::Aborted) => Ok(aborted_message()),
            Err(error) => {
                let mut message = Message::assistant_parts(Vec::new(), StopReason::Error);
                message.error_message = Some(error.to_string());
                Ok(message)
            }
        }
    }
}
