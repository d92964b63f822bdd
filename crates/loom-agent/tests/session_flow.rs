mod support;

use loom_agent::{
    AgentError, BufferedEventEmitter, EventKind, PromptStatus, PruneConfig, Session,
    SessionState, ToolRegistry,
};
use loom_llm::{Client, CompletionTransport, Role, StopReason};
use loom_store::{EntryKind, EntryStore, FsEntryStore, MemoryEntryStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use support::*;
use tempfile::tempdir;
use tokio::sync::Notify;

fn user_texts(messages: &[loom_llm::Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|message| message.role == Role::User)
        .map(loom_llm::Message::text)
        .collect()
}

#[tokio::test(flavor = "current_thread")]
async fn steer_during_prompt_is_the_next_turn() {
    let gate = Arc::new(Notify::new());
    let transport = SequenceTransport::new(vec![
        Scripted::Gated(gate.clone(), text_response("reply to A")),
        Scripted::Reply(text_response("reply to B")),
        Scripted::Reply(text_response("reply to C")),
    ]);
    let session = memory_session(transport).await;

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.prompt("A").await }
    });
    wait_for_streaming(&session).await;

    session.steer("B").expect("steer never fails while streaming");
    let error = session
        .prompt("C")
        .await
        .expect_err("prompt while streaming must fail");
    assert!(error.is_concurrency());

    gate.notify_one();
    let outcome = running.await.expect("join").expect("prompt A");
    assert_eq!(outcome.status, PromptStatus::Completed);
    assert_eq!(outcome.turns, 2);

    session.prompt("C").await.expect("prompt C once idle");
    let messages = session.messages().await.expect("messages");
    assert_eq!(user_texts(&messages), vec!["A", "B", "C"]);
    assert_eq!(messages[1].text(), "reply to A");
    assert_eq!(messages[3].text(), "reply to B");
}

#[tokio::test(flavor = "current_thread")]
async fn only_one_stream_is_observable_at_a_time() {
    let gate = Arc::new(Notify::new());
    let transport = SequenceTransport::new(vec![Scripted::Gated(
        gate.clone(),
        text_response("first"),
    )]);
    let session = memory_session(transport.clone()).await;

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.prompt("first").await }
    });
    wait_for_streaming(&session).await;

    let contenders: Vec<_> = (0..5)
        .map(|n| {
            let session = session.clone();
            tokio::spawn(async move { session.prompt(format!("contender {n}")).await })
        })
        .collect();
    for contender in contenders {
        let result = contender.await.expect("join");
        assert!(matches!(result, Err(ref error) if error.is_concurrency()));
    }
    session.follow_up("queued").expect("follow up while streaming");

    gate.notify_one();
    running
        .await
        .expect("join")
        .expect_err("the queued follow-up finds no scripted reply");
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn branch_view_survives_reopening_the_log() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("session.jsonl");
    let store: Arc<dyn EntryStore> = Arc::new(FsEntryStore::open(&path).expect("open store"));
    let transport = SequenceTransport::new(vec![
        Scripted::Reply(text_response("answer one")),
        Scripted::Reply(text_response("answer two")),
        Scripted::Reply(text_response("summary of two")),
    ]);
    let session = session_with(transport, store, ToolRegistry::default()).await;
    session.prompt("question one").await.expect("prompt one");
    session.prompt("question two").await.expect("prompt two");

    let outcome = session.branch(1).await.expect("branch");
    assert_eq!(outcome.abandoned, 2);
    let expected = vec!["question one".to_string(), "answer one".to_string()];
    let texts: Vec<String> = session
        .messages()
        .await
        .expect("messages")
        .iter()
        .map(loom_llm::Message::text)
        .collect();
    assert_eq!(texts, expected);
    session.dispose().await.expect("dispose");

    let reopened: Arc<dyn EntryStore> =
        Arc::new(FsEntryStore::open(&path).expect("reopen store"));
    let session = session_with(SequenceTransport::default(), reopened, ToolRegistry::default()).await;
    let texts: Vec<String> = session
        .messages()
        .await
        .expect("messages")
        .iter()
        .map(loom_llm::Message::text)
        .collect();
    assert_eq!(texts, expected);
    let branch = session.branch_entries().await.expect("branch entries");
    assert!(matches!(
        branch.last().map(|entry| &entry.kind),
        Some(EntryKind::BranchSummary { .. })
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn auto_prune_redacts_old_tool_output_between_completions() {
    let big = "x".repeat(4_000);
    let transport = SequenceTransport::new(vec![
        Scripted::Reply(tool_call_response("c1", "echo", serde_json::json!({ "value": big }))),
        Scripted::Reply(tool_call_response("c2", "echo", serde_json::json!({ "value": big }))),
        Scripted::Reply(tool_call_response("c3", "echo", serde_json::json!({ "value": big }))),
        Scripted::Reply(text_response("done")),
    ]);
    let mut tools = ToolRegistry::default();
    tools.register(echo_tool("echo"));
    let events = BufferedEventEmitter::default();
    let config = test_config().with_auto_prune(true).with_prune(PruneConfig {
        protect_tokens: 1_500,
        minimum_savings: 500,
        protected_tools: BTreeSet::new(),
    });
    let session = Session::builder(Arc::new(transport.clone()), Arc::new(MemoryEntryStore::new()))
        .config(config)
        .tools(tools)
        .emitter(Arc::new(events.clone()))
        .build()
        .await
        .expect("session should build");

    session.prompt("read everything").await.expect("prompt");

    let stats = session.stats().await.expect("stats");
    assert_eq!(stats.tool_results, 3);
    assert_eq!(stats.pruned_tool_results, 1);
    assert!(events.kinds().contains(&EventKind::Pruned));

    let last_request = transport.requests().pop().expect("final request");
    let oldest = tool_result_text(&last_request.messages, "c1").expect("c1 result");
    assert!(oldest.len() < 200, "oldest result should be a notice: {oldest}");
    let newest = tool_result_text(&last_request.messages, "c3").expect("c3 result");
    assert_eq!(newest.len(), 4_000);

    let again = session.prune_now().await.expect("second pass");
    assert_eq!(again.pruned_count, 0);
}

#[tokio::test(flavor = "current_thread")]
async fn dispose_cancels_the_active_stream() {
    let gate = Arc::new(Notify::new());
    let transport = SequenceTransport::new(vec![Scripted::Gated(gate, text_response("never"))]);
    let session = memory_session(transport).await;

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.prompt("long").await }
    });
    wait_for_streaming(&session).await;
    session.dispose().await.expect("dispose");

    let outcome = running.await.expect("join").expect("aborted, not failed");
    assert_eq!(outcome.status, PromptStatus::Aborted);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.prompt("again").await,
        Err(AgentError::Session(_))
    ));
    let messages = session.messages().await.expect("messages");
    assert_eq!(
        messages.last().and_then(|message| message.stop_reason),
        Some(StopReason::Aborted)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn provider_routing_follows_model_changes() {
    let primary = SequenceTransport::replies(&["from primary"]);
    let secondary = SequenceTransport::replies(&["from secondary"]);
    let mut providers: HashMap<String, Arc<dyn CompletionTransport>> = HashMap::new();
    providers.insert("primary".to_string(), Arc::new(primary.clone()));
    providers.insert("secondary".to_string(), Arc::new(secondary.clone()));
    let client = Client::new(providers, Some("primary".to_string()));

    let session = Session::builder(Arc::new(client), Arc::new(MemoryEntryStore::new()))
        .config(test_config().with_provider("secondary"))
        .build()
        .await
        .expect("session should build");

    let first = session.prompt("one").await.expect("first prompt");
    assert_eq!(
        first.last_message.map(|message| message.text()),
        Some("from secondary".to_string())
    );

    session
        .set_model("other-model", Some("primary".to_string()))
        .await
        .expect("switch provider");
    let second = session.prompt("two").await.expect("second prompt");
    assert_eq!(
        second.last_message.map(|message| message.text()),
        Some("from primary".to_string())
    );

    assert_eq!(secondary.requests().len(), 1);
    let routed = primary.requests();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].model, "other-model");
    assert_eq!(routed[0].provider.as_deref(), Some("primary"));
}
