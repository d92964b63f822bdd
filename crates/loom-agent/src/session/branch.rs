use super::*;
use crate::{BranchSummaryOutcome, NO_SUMMARY_PLACEHOLDER, SummaryTarget, summarize_branch};
use loom_store::{common_ancestor, is_ancestor_or_self};

/// Clears the navigation flag on every exit path.
struct NavigationGuard<'a> {
    session: &'a Session,
}

impl Drop for NavigationGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.lock();
        inner.navigating = false;
        if inner.state != SessionState::Streaming {
            inner.active_signal = None;
        }
    }
}

/// Entries on the branch ending at `leaf` that are not ancestors of `target`.
fn abandoned_entries(
    entries: &[SessionEntry],
    leaf: Option<EntryIndex>,
    target: EntryIndex,
) -> Vec<SessionEntry> {
    let fork = common_ancestor(entries, Some(target), leaf);
    let path = branch_path(entries, leaf);
    let start = match fork {
        Some(fork) => path
            .iter()
            .position(|index| *index == fork)
            .map_or(path.len(), |position| position + 1),
        None => 0,
    };
    path[start..]
        .iter()
        .map(|index| entries[*index].clone())
        .collect()
}

impl Session {
    /// Move the leaf to `index`, summarizing the branch being left.
    ///
    /// Fails when `index` is on the branch of the active stream, or while
    /// another navigation runs. Any other target waits for an active stream to
    /// finish. The summary is stored as a `branch_summary` child of `index` and
    /// becomes the new leaf. A failed summary stores a placeholder; a cancelled
    /// one leaves the leaf where it was.
    pub async fn branch(&self, index: EntryIndex) -> Result<BranchOutcome, AgentError> {
        let streaming = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Closed => return Err(AgentError::session_closed()),
                _ if inner.navigating => {
                    return Err(ConcurrencyError::NavigationInProgress.into());
                }
                state => {
                    inner.navigating = true;
                    state == SessionState::Streaming
                }
            }
        };
        let _guard = NavigationGuard { session: self };

        let entries = self.store.entries().await?;
        if index >= entries.len() {
            return Err(SessionError::UnknownEntry(index).into());
        }
        if streaming && is_ancestor_or_self(&entries, index, self.store.leaf().await?) {
            return Err(ConcurrencyError::BranchIntoActiveStream { index }.into());
        }

        let _flight = self.flight.lock().await;
        if self.state() == SessionState::Closed {
            return Err(AgentError::session_closed());
        }
        let entries = self.store.entries().await?;
        let leaf = self.store.leaf().await?;
        let abandoned = abandoned_entries(&entries, leaf, index);
        info!(session_id = %self.id, from = ?leaf, to = index, abandoned = abandoned.len(), "navigating branch");

        let mut outcome = BranchOutcome {
            leaf: Some(index),
            summary_index: None,
            abandoned: abandoned.len(),
            cancelled: false,
            summary_error: None,
        };
        if abandoned.is_empty() {
            self.store.set_leaf(Some(index)).await?;
            self.emit_navigated(leaf, &outcome)?;
            return Ok(outcome);
        }

        let signal = self.root_signal.child();
        let target = {
            let mut inner = self.lock();
            inner.active_signal = Some(signal.clone());
            SummaryTarget {
                model: inner.model.clone(),
                provider: inner.provider.clone(),
                api_key: self.config.api_key.clone(),
                abort_grace_ms: self.config.abort_grace_ms,
            }
        };
        let summary = summarize_branch(
            self.transport.as_ref(),
            &abandoned,
            &target,
            &self.config.branch_summary,
            signal,
        )
        .await;

        let summary_kind = match summary {
            BranchSummaryOutcome::Summarized(summary) => {
                {
                    let mut inner = self.lock();
                    inner.usage = inner.usage.clone() + summary.usage;
                }
                Some(EntryKind::BranchSummary {
                    summary: summary.summary,
                    from_index: leaf,
                    read_files: summary.read_files,
                    modified_files: summary.modified_files,
                })
            }
            BranchSummaryOutcome::Failed { error, file_ops } => {
                warn!(session_id = %self.id, error = %error, "storing placeholder branch summary");
                self.emit(
                    EventKind::Warning,
                    serde_json::json!({ "message": "branch summary failed", "error": error }),
                )?;
                outcome.summary_error = Some(error);
                Some(EntryKind::BranchSummary {
                    summary: format!("{NO_SUMMARY_PLACEHOLDER}{}", file_ops.render_suffix()),
                    from_index: leaf,
                    read_files: file_ops.read_files(),
                    modified_files: file_ops.modified_files(),
                })
            }
            BranchSummaryOutcome::Cancelled => {
                info!(session_id = %self.id, "branch summary cancelled; leaf unchanged");
                outcome.cancelled = true;
                outcome.leaf = leaf;
                return Ok(outcome);
            }
            BranchSummaryOutcome::NothingToSummarize => None,
        };

        match summary_kind {
            Some(kind) => {
                let entry = self.store.append(Some(index), kind).await?;
                self.store.set_leaf(Some(entry.index)).await?;
                outcome.leaf = Some(entry.index);
                outcome.summary_index = Some(entry.index);
                self.emit(
                    EventKind::BranchSummarized,
                    serde_json::json!({
                        "index": entry.index,
                        "target": index,
                        "placeholder": outcome.summary_error.is_some(),
                    }),
                )?;
            }
            None => self.store.set_leaf(Some(index)).await?,
        }
        self.emit_navigated(leaf, &outcome)?;
        Ok(outcome)
    }

    fn emit_navigated(
        &self,
        from: Option<EntryIndex>,
        outcome: &BranchOutcome,
    ) -> Result<(), AgentError> {
        self.emit(
            EventKind::BranchNavigated,
            serde_json::json!({
                "from": from,
                "to": outcome.leaf,
                "abandoned": outcome.abandoned,
            }),
        )
    }
}
