//! Completion transport contract for loom.
//!
//! The agent core never speaks a provider wire protocol. It builds a [`Request`],
//! hands it to a [`CompletionTransport`] together with an [`AbortSignal`], and
//! reads back a [`Response`] whose [`StopReason`] tells it how the call ended.

pub mod client;
pub mod errors;
pub mod signal;
pub mod types;

pub use client::{Client, CompletionTransport};
pub use errors::SDKError;
pub use signal::AbortSignal;
pub use types::*;
