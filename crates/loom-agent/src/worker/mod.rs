//! Worker protocol: a parent and an isolated agent loop exchanging tagged
//! messages, with proxied tool calls correlated by `callId`.

mod client;
mod in_process;
mod protocol;
mod router;
mod stdio;

pub use client::WorkerClient;
pub use in_process::{InProcessBackend, ProtocolEventEmitter, run_worker};
pub use protocol::{
    ProxyCall, ProxyCancel, ProxyCapability, ProxyResult, ProxyToolSpec, WorkerChannel,
    WorkerDone, WorkerMessage, WorkerStartPayload, worker_channel,
};
pub use router::{ParentRouter, ProxyContext, ProxyHandler, ProxyHandlers, RegistryProxyHandler};
pub use stdio::{run_stdio_worker, stdio_channel};
