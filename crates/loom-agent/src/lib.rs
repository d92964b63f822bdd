//! Orchestration core for the loom coding agent.
//!
//! A [`Session`] owns one branching conversation log and the single in-flight
//! completion against it. Around it sit the pieces that keep that log usable:
//! token estimation, pruning of old tool output, branch summarization, and the
//! `task` capability, which delegates work to in-process workers (through the
//! worker protocol router) or to agent subprocesses.

pub mod config;
pub mod errors;
pub mod events;
pub mod pruning;
pub mod session;
pub mod subprocess;
pub mod summarizer;
pub mod tokens;
pub mod tools;
pub mod truncation;
pub mod worker;

pub use config::*;
pub use errors::*;
pub use events::*;
pub use pruning::*;
pub use session::*;
pub use subprocess::*;
pub use summarizer::*;
pub use tokens::*;
pub use tools::*;
pub use truncation::*;
pub use worker::*;
