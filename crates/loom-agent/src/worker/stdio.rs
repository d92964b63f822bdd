//! Worker protocol over a child process's stdin and stdout.

use super::protocol::{WorkerChannel, WorkerDone, WorkerMessage, WorkerStartPayload};
use super::router::ParentRouter;
use crate::{AgentError, WorkerError, terminate_tree};
use loom_llm::AbortSignal;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bridge a line-delimited byte stream onto the parent end of a [`WorkerChannel`].
///
/// Messages sent on the returned channel are written to `writer` one JSON line
/// each. Lines read from `reader` are decoded and forwarded; undecodable lines
/// are logged and skipped. The receiver closes when `reader` reaches EOF, and
/// `writer` is dropped once the sender side goes away.
pub fn stdio_channel<R, W>(reader: R, writer: W) -> WorkerChannel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (to_worker, mut outbound) = mpsc::unbounded_channel::<WorkerMessage>();
    let (inbound, from_worker) = mpsc::unbounded_channel::<WorkerMessage>();

    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbound.recv().await {
            let line = match message.encode_line() {
                Ok(line) => line,
                Err(error) => {
                    warn!(error = %error, kind = message.type_name(), "dropping unencodable message");
                    continue;
                }
            };
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            };
            if let Err(error) = written.await {
                debug!(error = %error, "worker stdin closed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    debug!(error = %error, "worker stdout closed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match WorkerMessage::decode_line(&line) {
                Ok(message) => {
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Err(error) => warn!(error = %error, "skipping malformed worker line"),
            }
        }
    });

    WorkerChannel {
        sender: to_worker,
        receiver: from_worker,
    }
}

/// Spawn `command` as a worker process, send it `start`, and route its proxy
/// calls through `router` until it reports `done`.
///
/// The process gets `exit_grace` to exit after the run ends; past that its
/// whole process tree is terminated.
pub async fn run_stdio_worker(
    router: &ParentRouter,
    mut command: Command,
    start: WorkerStartPayload,
    signal: AbortSignal,
    exit_grace: Duration,
) -> Result<WorkerDone, AgentError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|error| AgentError::ProcessSpawn(format!("worker: {error}")))?;
    let pid = child.id();
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(AgentError::ProcessSpawn(
            "worker stdio is not piped".to_string(),
        ));
    };
    info!(?pid, "worker process started");

    let channel = stdio_channel(stdout, stdin);
    channel
        .sender
        .send(WorkerMessage::Start(start))
        .map_err(|_| WorkerError::ChannelClosed)?;
    let outcome = router.run(channel, signal).await;

    match tokio::time::timeout(exit_grace, child.wait()).await {
        Ok(status) => debug!(?pid, ?status, "worker process exited"),
        Err(_) => {
            warn!(?pid, "worker process outlived its run");
            match pid {
                Some(pid) => terminate_tree(pid, exit_grace).await,
                None => {
                    let _ = child.start_kill();
                }
            }
            let _ = child.wait().await;
        }
    }
    Ok(outcome?)
}
