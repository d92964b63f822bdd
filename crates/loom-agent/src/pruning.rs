//! Redaction of old tool output under a token budget.

use chrono::{DateTime, Utc};
use loom_llm::ContentPart;
use loom_store::{EntryIndex, EntryStore, EntryStoreError, PruneMark, SessionEntry};
use tracing::{debug, info};

use crate::config::PruneConfig;
use crate::tokens::{estimate_message_tokens, estimate_text_tokens};

pub fn prune_notice(tokens: u64) -> String {
    format!("[Output truncated - {tokens} tokens]")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PruneCandidate {
    pub index: EntryIndex,
    pub tokens: u64,
    pub savings: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrunePlan {
    /// Newest first, in walk order.
    pub candidates: Vec<PruneCandidate>,
    pub total_savings: u64,
    /// Estimated tool-output tokens across the whole branch, pruned entries included.
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub pruned_count: usize,
    pub tokens_saved: u64,
    pub pruned_at: Option<DateTime<Utc>>,
}

impl PruneResult {
    pub fn is_noop(&self) -> bool {
        self.pruned_count == 0
    }
}

/// Decide which tool results on `branch` (root first) would be pruned.
///
/// The walk goes newest to oldest and accumulates the estimate of every tool
/// result, already pruned ones included. An entry is exempt while the running
/// total is still below `protect_tokens` or when its tool is protected.
pub fn plan_prune(branch: &[SessionEntry], config: &PruneConfig) -> PrunePlan {
    let mut plan = PrunePlan::default();
    for entry in branch.iter().rev() {
        let Some(message) = entry.message().filter(|_| entry.is_tool_result()) else {
            continue;
        };
        let tokens = estimate_message_tokens(message);
        let protected_tool = message
            .tool_name
            .as_deref()
            .is_some_and(|name| config.protected_tools.contains(name));
        let exempt = plan.total_tokens < config.protect_tokens || protected_tool;
        plan.total_tokens += tokens;

        if exempt || entry.pruned_at().is_some() {
            continue;
        }
        let savings = tokens.saturating_sub(estimate_text_tokens(&prune_notice(tokens)));
        plan.total_savings += savings;
        plan.candidates.push(PruneCandidate {
            index: entry.index,
            tokens,
            savings,
        });
    }
    plan
}

/// Run one pruning pass over `branch` and commit it through `store`.
///
/// The pass is a no-op when there are no candidates or their combined savings
/// stay below `minimum_savings`.
pub async fn prune_branch(
    store: &dyn EntryStore,
    branch: &[SessionEntry],
    config: &PruneConfig,
) -> Result<PruneResult, EntryStoreError> {
    let plan = plan_prune(branch, config);
    if plan.candidates.is_empty() || plan.total_savings < config.minimum_savings {
        debug!(
            candidates = plan.candidates.len(),
            savings = plan.total_savings,
            minimum = config.minimum_savings,
            "prune pass below threshold"
        );
        return Ok(PruneResult::default());
    }

    let pruned_at = Utc::now();
    let marks = plan
        .candidates
        .iter()
        .map(|candidate| PruneMark {
            index: candidate.index,
            content: vec![ContentPart::text(prune_notice(candidate.tokens))],
        })
        .collect();
    store.mark_pruned(marks, pruned_at).await?;

    info!(
        pruned = plan.candidates.len(),
        saved = plan.total_savings,
        "pruned old tool output"
    );
    Ok(PruneResult {
        pruned_count: plan.candidates.len(),
        tokens_saved: plan.total_savings,
        pruned_at: Some(pruned_at),
    })
}
