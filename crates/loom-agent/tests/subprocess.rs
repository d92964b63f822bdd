#![cfg(unix)]

mod support;

use loom_agent::{
    ExecutorConfig, NoopEventEmitter, ParentRouter, ProgressStatus, ProxyCapability,
    ProxyHandlers, RegistryProxyHandler, SubprocessExecutor, TaskSpec, ToolRegistry, WorkerConfig,
    WorkerStartPayload, run_stdio_worker,
};
use loom_llm::AbortSignal;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

fn script(dir: &TempDir, body: &str) -> String {
    let path = dir.path().join("agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    path.to_string_lossy().into_owned()
}

fn executor(script: String, configure: impl FnOnce(&mut ExecutorConfig)) -> SubprocessExecutor {
    let mut config = ExecutorConfig::default().with_program("/bin/sh", vec![script]);
    config.kill_grace_ms = 1_000;
    configure(&mut config);
    SubprocessExecutor::new(config)
}

const FIVE_MESSAGES: &str = r#"echo "booting"
for n in 1 2 3 4 5; do
  printf '{"type":"message_end","message":{"role":"assistant","content":[{"type":"text","text":"line %s"}]}}\n' "$n"
done"#;

#[tokio::test(flavor = "current_thread")]
async fn output_is_cut_to_the_line_budget() {
    let dir = tempdir().expect("tempdir");
    let executor = executor(script(&dir, FIVE_MESSAGES), |config| {
        config.max_output_lines = 3;
    });

    let result = executor
        .run(0, &TaskSpec::new("count"), &AbortSignal::new())
        .await;
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, "line 1\nline 2\nline 3");
    assert_eq!(result.output.lines().count(), 3);
    assert!(result.truncated);
    assert!(result.succeeded());
}

#[tokio::test(flavor = "current_thread")]
async fn final_output_and_progress_come_from_the_event_stream() {
    let dir = tempdir().expect("tempdir");
    let body = r#"printf '{"type":"tool_execution_start","toolName":"read","args":{"path":"src/lib.rs"}}\n'
printf 'not json at all\n'
printf '{"type":"tool_execution_end","toolName":"read"}\n'
printf '{"type":"message_end","message":{"role":"assistant","content":"flag=%s","usage":{"totalTokens":7}}}\n' "$LOOM_NO_SUBAGENTS"
printf '{"type":"agent_end","messages":[{"role":"assistant","content":"final flag=%s"}]}\n' "$LOOM_NO_SUBAGENTS""#;
    let executor = executor(script(&dir, body), |_| {});
    let progress = executor.subscribe();

    let result = executor
        .run(2, &TaskSpec::new("inspect"), &AbortSignal::new())
        .await;
    assert!(result.succeeded(), "{result:?}");
    assert_eq!(result.index, 2);
    assert_eq!(result.output, "final flag=1");
    assert_eq!(result.tokens, 7);
    assert!(!result.truncated);

    let snapshot = progress.borrow().get(&2).cloned().expect("progress for task 2");
    assert_eq!(snapshot.status, ProgressStatus::Completed);
    assert_eq!(snapshot.tool_count, 1);
    assert_eq!(snapshot.recent_tools[0].tool, "read");
    assert!(snapshot.recent_tools[0].args_preview.contains("src/lib.rs"));
}

#[tokio::test(flavor = "current_thread")]
async fn recursion_flag_is_left_unset_when_allowed() {
    let dir = tempdir().expect("tempdir");
    let body = r#"printf '{"type":"message_end","message":{"role":"assistant","content":"flag=%s"}}\n' "${LOOM_NO_SUBAGENTS:-unset}""#;
    let executor = executor(script(&dir, body), |config| {
        config.allow_recursion = true;
    });

    let result = executor
        .run(0, &TaskSpec::new("nest"), &AbortSignal::new())
        .await;
    assert_eq!(result.output, "flag=unset");
}

#[tokio::test(flavor = "current_thread")]
async fn system_prompt_file_exists_only_for_the_run() {
    let dir = tempdir().expect("tempdir");
    let body = r#"if [ "$1" = "--append-system-prompt" ]; then
  printf '{"type":"message_end","message":{"role":"assistant","content":"%s"}}\n' "$(cat "$2")"
  printf '{"type":"message_end","message":{"role":"assistant","content":"%s"}}\n' "$2"
fi"#;
    let executor = executor(script(&dir, body), |_| {});
    let spec = TaskSpec {
        system_prompt: Some("be terse".to_string()),
        ..TaskSpec::new("summarize")
    };

    let result = executor.run(0, &spec, &AbortSignal::new()).await;
    let mut lines = result.output.lines();
    assert_eq!(lines.next(), Some("be terse"));
    let path = lines.next().expect("prompt file path");
    assert!(path.contains("loom-task-"));
    assert!(!Path::new(path).exists());
}

#[tokio::test(flavor = "current_thread")]
async fn abort_terminates_the_process_tree() {
    let dir = tempdir().expect("tempdir");
    let body = r#"printf '{"type":"message_end","message":{"role":"assistant","content":"started"}}\n'
sleep 30 &
sleep 30"#;
    let executor = executor(script(&dir, body), |_| {});
    let signal = AbortSignal::new();
    tokio::spawn({
        let signal = signal.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            signal.abort();
        }
    });

    let started = Instant::now();
    let result = executor.run(0, &TaskSpec::new("hang"), &signal).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.cancelled, "{result:?}");
    assert_ne!(result.exit_code, Some(0));
    assert_eq!(result.output, "started");
    assert!(result.error.is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn failures_carry_the_stderr_tail() {
    let dir = tempdir().expect("tempdir");
    let executor = executor(script(&dir, "echo 'model not found' >&2\nexit 3"), |_| {});

    let result = executor
        .run(0, &TaskSpec::new("fail"), &AbortSignal::new())
        .await;
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.cancelled);
    assert_eq!(result.error.as_deref(), Some("model not found"));
}

#[tokio::test(flavor = "current_thread")]
async fn spawn_failure_is_reported_in_the_result() {
    let executor = SubprocessExecutor::new(
        ExecutorConfig::default().with_program("/nonexistent/loom-agent", Vec::new()),
    );
    let spec = TaskSpec {
        system_prompt: Some("unused".to_string()),
        ..TaskSpec::new("anything")
    };

    let result = executor.run(0, &spec, &AbortSignal::new()).await;
    assert_eq!(result.exit_code, None);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|error| error.contains("failed to spawn"))
    );
}

fn worker_router(grace_ms: u64) -> ParentRouter {
    let mut tools = ToolRegistry::default();
    tools.register(support::echo_tool("lookup"));
    let handler = RegistryProxyHandler::new(Arc::new(tools), "parent", Arc::new(NoopEventEmitter));
    ParentRouter::new(
        "parent",
        ProxyHandlers::default().with(ProxyCapability::Mcp, Arc::new(handler)),
        Arc::new(NoopEventEmitter),
        WorkerConfig {
            call_timeout_ms: 5_000,
            abort_grace_ms: grace_ms,
        },
    )
}

fn worker_command(dir: &TempDir, body: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("/bin/sh");
    command.arg(script(dir, body));
    command
}

fn start(task: &str) -> WorkerStartPayload {
    WorkerStartPayload {
        parent_session_id: "parent".to_string(),
        task: task.to_string(),
        model: "test-model".to_string(),
        ..WorkerStartPayload::default()
    }
}

#[tokio::test(flavor = "current_thread")]
async fn stdio_worker_calls_are_served_by_the_parent() {
    let dir = tempdir().expect("tempdir");
    let body = r#"read start
case "$start" in *'"type":"start"'*'"task":"look it up"'*) ;; *) exit 9 ;; esac
echo "worker booting"
printf '{"type":"mcp_call","callId":"c1","toolName":"lookup","arguments":{"value":"42"}}\n'
read result
case "$result" in *'"type":"mcp_result"'*'"result":"42"'*) answer=forty-two ;; *) answer=wrong ;; esac
printf '{"type":"done","exitCode":0,"durationMs":1,"output":"%s","tokens":3}\n' "$answer""#;

    let done = run_stdio_worker(
        &worker_router(1_000),
        worker_command(&dir, body),
        start("look it up"),
        AbortSignal::new(),
        Duration::from_secs(2),
    )
    .await
    .expect("worker run");
    assert_eq!(done.exit_code, 0);
    assert_eq!(done.output, "forty-two");
    assert_eq!(done.tokens, 3);
    assert!(!done.aborted);
}

#[tokio::test(flavor = "current_thread")]
async fn stdio_worker_acknowledges_parent_abort() {
    let dir = tempdir().expect("tempdir");
    let body = r#"read start
read next
case "$next" in *'"type":"abort"'*) ;; *) exit 9 ;; esac
printf '{"type":"done","exitCode":1,"durationMs":1,"aborted":true}\n'"#;
    let signal = AbortSignal::new();
    tokio::spawn({
        let signal = signal.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            signal.abort();
        }
    });

    let started = Instant::now();
    let done = run_stdio_worker(
        &worker_router(2_000),
        worker_command(&dir, body),
        start("wait"),
        signal,
        Duration::from_secs(2),
    )
    .await
    .expect("worker run");
    assert!(done.aborted);
    assert_eq!(done.error, None);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "current_thread")]
async fn stdio_worker_exiting_without_done_closes_the_channel() {
    let dir = tempdir().expect("tempdir");
    let error = run_stdio_worker(
        &worker_router(1_000),
        worker_command(&dir, "read start\nexit 0"),
        start("vanish"),
        AbortSignal::new(),
        Duration::from_secs(2),
    )
    .await
    .expect_err("no done message");
    assert!(error.to_string().contains("closed"), "{error}");
}
