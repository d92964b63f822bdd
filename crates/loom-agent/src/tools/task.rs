use super::{RegisteredTool, ToolContext, ToolExecutor};
use crate::{AgentError, subagents_disabled_by_env};
use async_trait::async_trait;
use futures::future::join_all;
use loom_llm::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const TASK_TOOL_NAME: &str = "task";
pub const MAX_PARALLEL_TASKS: usize = 8;

/// One delegated sub-task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TaskSpec {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

/// Normalized completion report of a delegated task, whichever worker ran it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub index: usize,
    pub task: String,
    pub exit_code: Option<i32>,
    pub output: String,
    pub truncated: bool,
    pub duration_ms: u64,
    pub tokens: u64,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn failed(index: usize, task: &str, error: impl Into<String>) -> Self {
        Self {
            index,
            task: task.to_string(),
            exit_code: None,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.error.is_none() && self.exit_code == Some(0)
    }
}

/// Something that can run a delegated task to completion.
///
/// Backends report every failure, spawn errors included, inside the
/// [`TaskResult`]; a failing task never fails the tool call that owns it.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn run_task(&self, index: usize, spec: TaskSpec, context: ToolContext) -> TaskResult;
}

/// The `task` capability: fans tasks out to a [`TaskBackend`].
#[derive(Clone)]
pub struct TaskTool {
    backend: Arc<dyn TaskBackend>,
    subagents_enabled: bool,
}

impl TaskTool {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self {
            backend,
            subagents_enabled: !subagents_disabled_by_env(),
        }
    }

    pub fn with_subagents_enabled(mut self, enabled: bool) -> Self {
        self.subagents_enabled = enabled;
        self
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition {
            name: TASK_TOOL_NAME.to_string(),
            description: "Delegate one or more self-contained tasks to isolated subagents and wait for their results.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string" },
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["task"],
                            "properties": {
                                "task": { "type": "string" },
                                "system_prompt": { "type": "string" },
                                "model": { "type": "string" }
                            }
                        }
                    }
                }
            }),
        }
    }

    pub fn into_registered(self) -> RegisteredTool {
        let tool = Arc::new(self);
        let executor: ToolExecutor = Arc::new(move |arguments, context| {
            let tool = tool.clone();
            Box::pin(async move { tool.run(arguments, context).await })
        });
        RegisteredTool {
            definition: Self::definition(),
            executor,
        }
    }

    pub async fn run(&self, arguments: Value, context: ToolContext) -> Result<String, AgentError> {
        if !self.subagents_enabled {
            return Err(AgentError::ToolValidation(
                "subagents are disabled in this process".to_string(),
            ));
        }
        let specs = parse_task_specs(&arguments)?;
        info!(tasks = specs.len(), "delegating tasks");

        let runs = specs.into_iter().enumerate().map(|(index, spec)| {
            let backend = self.backend.clone();
            let context = context.clone();
            async move { backend.run_task(index, spec, context).await }
        });
        let results = join_all(runs).await;
        serde_json::to_string_pretty(&results)
            .map_err(|error| AgentError::Validation(error.to_string()))
    }
}

fn parse_task_specs(arguments: &Value) -> Result<Vec<TaskSpec>, AgentError> {
    let specs = if let Some(tasks) = arguments.get("tasks") {
        serde_json::from_value::<Vec<TaskSpec>>(tasks.clone())
            .map_err(|error| AgentError::ToolValidation(format!("invalid tasks: {error}")))?
    } else if let Some(task) = arguments.get("task").and_then(Value::as_str) {
        vec![TaskSpec::new(task)]
    } else {
        return Err(AgentError::ToolValidation(
            "either 'task' or 'tasks' is required".to_string(),
        ));
    };

    if specs.is_empty() {
        return Err(AgentError::ToolValidation("no tasks given".to_string()));
    }
    if specs.len() > MAX_PARALLEL_TASKS {
        return Err(AgentError::ToolValidation(format!(
            "at most {MAX_PARALLEL_TASKS} tasks may run at once, got {}",
            specs.len()
        )));
    }
    if let Some(blank) = specs.iter().position(|spec| spec.task.trim().is_empty()) {
        return Err(AgentError::ToolValidation(format!("task {blank} is empty")));
    }
    Ok(specs)
}
