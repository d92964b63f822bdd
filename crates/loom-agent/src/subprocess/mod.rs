//! Delegated agents as isolated child processes.

mod executor;
mod kill;
mod progress;

pub use executor::SubprocessExecutor;
pub use kill::terminate_tree;
#[cfg(unix)]
pub use kill::signal_tree;
pub use progress::{
    AgentProgress, MAX_RECENT_OUTPUT_LINES, MAX_RECENT_TOOLS, ProgressStatus, ToolActivity,
};
