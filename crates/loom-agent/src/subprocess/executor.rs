use super::{AgentProgress, ProgressStatus, terminate_tree};
use crate::{
    AgentError, ExecutorConfig, NO_SUBAGENTS_ENV, OutputBuffer, TaskBackend, TaskResult, TaskSpec,
    ToolContext, TruncatedOutput, truncate_output,
};
use async_trait::async_trait;
use loom_llm::AbortSignal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write as _;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const PROMPT_FILE_PREFIX: &str = "loom-task-";
const STDERR_TAIL_LINES: usize = 20;

/// Usage counters as the child reports them.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildUsage {
    #[serde(default)]
    input: u64,
    #[serde(default)]
    output: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl ChildUsage {
    fn tokens(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input + self.output
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildMessage {
    #[serde(default)]
    role: String,
    /// Either a plain string or a list of typed content parts.
    #[serde(default)]
    content: Value,
    #[serde(default)]
    usage: Option<ChildUsage>,
}

impl ChildMessage {
    fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// One line of the child's JSON event stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ChildEvent {
    ToolExecutionStart {
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    ToolExecutionEnd {
        tool_name: String,
        #[serde(default)]
        is_error: bool,
    },
    MessageUpdate {
        message: ChildMessage,
    },
    MessageEnd {
        message: ChildMessage,
    },
    AgentEnd {
        #[serde(default)]
        messages: Vec<ChildMessage>,
    },
    #[serde(other)]
    Unknown,
}

/// Folds the child's event stream into progress and the task output.
struct StreamState {
    output: OutputBuffer,
    final_output: Option<String>,
    tokens: u64,
    max_bytes: usize,
    max_lines: usize,
}

impl StreamState {
    fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            output: OutputBuffer::new(max_bytes, max_lines),
            final_output: None,
            tokens: 0,
            max_bytes,
            max_lines,
        }
    }

    /// Apply one stdout line. Returns whether `progress` changed.
    fn handle_line(&mut self, line: &str, progress: &mut AgentProgress) -> bool {
        let line = line.trim();
        if !line.starts_with('{') {
            return false;
        }
        let event = match serde_json::from_str::<ChildEvent>(line) {
            Ok(event) => event,
            Err(error) => {
                debug!(error = %error, "dropping malformed child event");
                return false;
            }
        };
        match event {
            ChildEvent::ToolExecutionStart { tool_name, args } => {
                progress.tool_started(&tool_name, &args);
            }
            ChildEvent::ToolExecutionEnd {
                tool_name,
                is_error,
            } => progress.tool_finished(&tool_name, is_error),
            ChildEvent::MessageUpdate { message } => {
                if !message.is_assistant() {
                    return false;
                }
                progress.replace_output(&message.text());
            }
            ChildEvent::MessageEnd { message } => {
                if !message.is_assistant() {
                    return false;
                }
                self.output.push_block(&message.text());
                if let Some(usage) = &message.usage {
                    self.tokens += usage.tokens();
                    progress.tokens = self.tokens;
                }
            }
            ChildEvent::AgentEnd { messages } => {
                self.final_output = messages
                    .iter()
                    .rev()
                    .filter(|message| message.is_assistant())
                    .map(ChildMessage::text)
                    .find(|text| !text.trim().is_empty());
                return false;
            }
            ChildEvent::Unknown => return false,
        }
        true
    }

    fn into_output(self) -> TruncatedOutput {
        match self.final_output {
            Some(text) => truncate_output(&text, self.max_bytes, self.max_lines),
            None => self.output.into_output(),
        }
    }
}

/// Runs delegated tasks as isolated agent processes.
///
/// Each run writes the task's system prompt to a temporary file, launches the
/// configured program in JSON streaming mode and reads its events from stdout.
/// Live progress for every running task is published on a watch channel keyed
/// by task index.
pub struct SubprocessExecutor {
    config: ExecutorConfig,
    progress: watch::Sender<BTreeMap<usize, AgentProgress>>,
}

impl SubprocessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let (progress, _) = watch::channel(BTreeMap::new());
        Self { config, progress }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<usize, AgentProgress>> {
        self.progress.subscribe()
    }

    fn publish(&self, progress: &AgentProgress) {
        let snapshot = progress.clone();
        self.progress.send_modify(|all| {
            all.insert(snapshot.index, snapshot);
        });
    }

    /// Run one task to completion. Spawn failures and non-zero exits are
    /// reported in the result, never as an error.
    pub async fn run(&self, index: usize, spec: &TaskSpec, signal: &AbortSignal) -> TaskResult {
        let started = Instant::now();
        let mut progress = AgentProgress::new(index, spec.task.clone());
        progress.status = ProgressStatus::Running;
        self.publish(&progress);

        let mut result = match self.execute(index, spec, signal, &mut progress).await {
            Ok(result) => result,
            Err(error) => {
                warn!(index, error = %error, "subagent failed to start");
                TaskResult::failed(index, &spec.task, error.to_string())
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;

        progress.status = if result.cancelled {
            ProgressStatus::Cancelled
        } else if result.succeeded() {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Failed
        };
        progress.duration_ms = result.duration_ms;
        progress.tokens = result.tokens;
        self.publish(&progress);
        result
    }

    fn command(&self, spec: &TaskSpec, prompt_file: Option<&NamedTempFile>) -> Command {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.base_args);
        if let Some(model) = spec.model.as_deref().filter(|model| !model.is_empty()) {
            command.arg("--model").arg(model);
        }
        if let Some(file) = prompt_file {
            command.arg("--append-system-prompt").arg(file.path());
        }
        command.arg(format!("Task: {}", spec.task));

        if !self.config.allow_recursion {
            command.env(NO_SUBAGENTS_ENV, "1");
        }
        command.envs(&self.config.env);
        if let Some(directory) = &self.config.working_directory {
            command.current_dir(directory);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn execute(
        &self,
        index: usize,
        spec: &TaskSpec,
        signal: &AbortSignal,
        progress: &mut AgentProgress,
    ) -> Result<TaskResult, AgentError> {
        if signal.is_aborted() {
            return Ok(TaskResult {
                index,
                task: spec.task.clone(),
                cancelled: true,
                ..TaskResult::default()
            });
        }

        // Removed when dropped, on every path out of this function.
        let prompt_file = match spec.system_prompt.as_deref() {
            Some(prompt) if !prompt.trim().is_empty() => Some(write_prompt_file(prompt)?),
            _ => None,
        };

        let mut child = self.command(spec, prompt_file.as_ref()).spawn().map_err(|error| {
            AgentError::ProcessSpawn(format!("failed to spawn {}: {error}", self.config.program))
        })?;
        let pid = child.id();
        info!(index, ?pid, program = %self.config.program, "subagent started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::ProcessSpawn("child stdout was not captured".to_string()))?;
        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        let mut state = StreamState::new(self.config.max_output_bytes, self.config.max_output_lines);
        let mut lines = BufReader::new(stdout).lines();
        let mut aborted = false;
        let mut killer = None;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if state.handle_line(&line, progress) {
                            self.publish(progress);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(index, error = %error, "failed to read subagent output");
                        break;
                    }
                },
                _ = signal.aborted(), if !aborted => {
                    aborted = true;
                    info!(index, ?pid, "terminating subagent");
                    match pid {
                        Some(pid) => {
                            let grace = Duration::from_millis(self.config.kill_grace_ms);
                            killer = Some(tokio::spawn(terminate_tree(pid, grace)));
                        }
                        None => {
                            let _ = child.start_kill();
                        }
                    }
                }
            }
        }

        let status = child.wait().await;
        if let Some(killer) = killer {
            killer.abort();
        }
        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(error) => {
                warn!(index, error = %error, "failed to wait for subagent");
                None
            }
        };
        let cancelled = aborted && exit_code != Some(0);
        let error = if cancelled || exit_code == Some(0) {
            None
        } else if stderr.trim().is_empty() {
            Some(match exit_code {
                Some(code) => format!("subagent exited with code {code}"),
                None => "subagent was terminated by a signal".to_string(),
            })
        } else {
            Some(stderr.trim().to_string())
        };
        info!(index, ?exit_code, cancelled, "subagent finished");

        let tokens = state.tokens;
        let output = state.into_output();
        Ok(TaskResult {
            index,
            task: spec.task.clone(),
            exit_code,
            output: output.text,
            truncated: output.truncated,
            duration_ms: 0,
            tokens,
            cancelled,
            error,
        })
    }
}

fn write_prompt_file(prompt: &str) -> Result<NamedTempFile, AgentError> {
    let mut file = tempfile::Builder::new()
        .prefix(PROMPT_FILE_PREFIX)
        .suffix(".md")
        .tempfile()
        .map_err(|error| {
            AgentError::ProcessSpawn(format!("failed to create system prompt file: {error}"))
        })?;
    file.write_all(prompt.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|error| {
            AgentError::ProcessSpawn(format!("failed to write system prompt file: {error}"))
        })?;
    Ok(file)
}

#[async_trait]
impl TaskBackend for SubprocessExecutor {
    async fn run_task(&self, index: usize, spec: TaskSpec, context: ToolContext) -> TaskResult {
        self.run(index, &spec, &context.signal).await
    }
}
