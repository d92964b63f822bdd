use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Set in a subagent's environment so it refuses to spawn further subagents.
pub const NO_SUBAGENTS_ENV: &str = "LOOM_NO_SUBAGENTS";
/// Overrides the program the subprocess executor launches.
pub const AGENT_BIN_ENV: &str = "LOOM_AGENT_BIN";

pub const DEFAULT_AGENT_PROGRAM: &str = "loom";

/// True when this process was launched as a non-recursive subagent.
pub fn subagents_disabled_by_env() -> bool {
    std::env::var(NO_SUBAGENTS_ENV)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PruneConfig {
    /// Most recent tool output, in estimated tokens, that is never pruned.
    pub protect_tokens: u64,
    /// A pass commits only when it would save at least this many tokens.
    pub minimum_savings: u64,
    pub protected_tools: BTreeSet<String>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            protect_tokens: 40_000,
            minimum_savings: 20_000,
            protected_tools: BTreeSet::from(["skill".to_string()]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchSummaryConfig {
    pub max_tokens: u32,
    pub custom_instructions: Option<String>,
    /// Model used for summaries; falls back to the session model.
    pub model: Option<String>,
}

impl Default for BranchSummaryConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2_048,
            custom_instructions: None,
            model: None,
        }
    }
}

/// Runtime configuration for a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub thinking_level: Option<String>,
    pub max_tool_rounds_per_turn: usize,
    pub abort_grace_ms: u64,
    pub prune: PruneConfig,
    pub auto_prune: bool,
    pub branch_summary: BranchSummaryConfig,
    pub tool_output_limit_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            provider: None,
            api_key: None,
            system_prompt: None,
            max_tokens: None,
            thinking_level: None,
            max_tool_rounds_per_turn: 50,
            abort_grace_ms: 5_000,
            prune: PruneConfig::default(),
            auto_prune: true,
            branch_summary: BranchSummaryConfig::default(),
            tool_output_limit_chars: 50_000,
        }
    }
}

impl SessionConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_prune(mut self, prune: PruneConfig) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_auto_prune(mut self, enabled: bool) -> Self {
        self.auto_prune = enabled;
        self
    }

    pub fn with_abort_grace_ms(mut self, grace_ms: u64) -> Self {
        self.abort_grace_ms = grace_ms;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub program: String,
    /// Arguments that put the child in machine-readable streaming mode.
    pub base_args: Vec<String>,
    pub max_output_bytes: usize,
    pub max_output_lines: usize,
    pub kill_grace_ms: u64,
    /// Leave the child free to spawn its own subagents.
    pub allow_recursion: bool,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_AGENT_PROGRAM.to_string(),
            base_args: vec![
                "--mode".to_string(),
                "json".to_string(),
                "--print".to_string(),
                "--no-session".to_string(),
            ],
            max_output_bytes: 500_000,
            max_output_lines: 5_000,
            kill_grace_ms: 5_000,
            allow_recursion: false,
            working_directory: None,
            env: BTreeMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(program) = std::env::var(AGENT_BIN_ENV) {
            if !program.trim().is_empty() {
                config.program = program;
            }
        }
        config
    }

    pub fn with_program(mut self, program: impl Into<String>, base_args: Vec<String>) -> Self {
        self.program = program.into();
        self.base_args = base_args;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub call_timeout_ms: u64,
    /// How long the parent waits for `done` after sending `abort`.
    pub abort_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 120_000,
            abort_grace_ms: 5_000,
        }
    }
}
