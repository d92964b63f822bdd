use crate::store::{EntryStore, EntryStoreError, EntryStoreResult, PruneMark};
use crate::types::{EntryIndex, EntryKind, SessionEntry, SessionHeader};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub header: SessionHeader,
    pub entries: Vec<SessionEntry>,
    pub leaf: Option<EntryIndex>,
}

impl MemoryState {
    pub fn with_header(header: SessionHeader) -> Self {
        Self {
            header,
            entries: Vec::new(),
            leaf: None,
        }
    }

    fn check_index(&self, index: EntryIndex) -> EntryStoreResult<()> {
        if index < self.entries.len() {
            Ok(())
        } else {
            Err(EntryStoreError::entry_not_found(index))
        }
    }

    pub fn append(
        &mut self,
        parent: Option<EntryIndex>,
        kind: EntryKind,
    ) -> EntryStoreResult<SessionEntry> {
        if let Some(parent) = parent {
            self.check_index(parent)?;
        }
        let entry = SessionEntry {
            index: self.entries.len(),
            parent,
            timestamp: Utc::now(),
            kind,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn set_leaf(&mut self, leaf: Option<EntryIndex>) -> EntryStoreResult<()> {
        if let Some(index) = leaf {
            self.check_index(index)?;
        }
        self.leaf = leaf;
        Ok(())
    }

    pub fn mark_pruned(
        &mut self,
        marks: Vec<PruneMark>,
        pruned_at: DateTime<Utc>,
    ) -> EntryStoreResult<()> {
        for mark in &marks {
            self.check_index(mark.index)?;
            if !matches!(self.entries[mark.index].kind, EntryKind::Message { .. }) {
                return Err(EntryStoreError::InvalidInput(format!(
                    "entry {} is not a message",
                    mark.index
                )));
            }
        }
        for mark in marks {
            if let EntryKind::Message {
                message,
                pruned_at: stamp,
            } = &mut self.entries[mark.index].kind
            {
                message.content = mark.content;
                *stamp = Some(pruned_at);
            }
        }
        Ok(())
    }
}

/// In-memory session log with no backing file.
#[derive(Clone, Debug, Default)]
pub struct MemoryEntryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(header: SessionHeader) -> Self {
        Self::from_state(MemoryState::with_header(header))
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn lock(&self) -> EntryStoreResult<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| EntryStoreError::Backend("memory entry store mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl EntryStore for MemoryEntryStore {
    async fn header(&self) -> EntryStoreResult<SessionHeader> {
        Ok(self.lock()?.header.clone())
    }

    async fn entries(&self) -> EntryStoreResult<Vec<SessionEntry>> {
        Ok(self.lock()?.entries.clone())
    }

    async fn entry(&self, index: EntryIndex) -> EntryStoreResult<SessionEntry> {
        self.lock()?
            .entries
            .get(index)
            .cloned()
            .ok_or_else(|| EntryStoreError::entry_not_found(index))
    }

    async fn leaf(&self) -> EntryStoreResult<Option<EntryIndex>> {
        Ok(self.lock()?.leaf)
    }

    async fn append(
        &self,
        parent: Option<EntryIndex>,
        kind: EntryKind,
    ) -> EntryStoreResult<SessionEntry> {
        self.lock()?.append(parent, kind)
    }

    async fn set_leaf(&self, leaf: Option<EntryIndex>) -> EntryStoreResult<()> {
        self.lock()?.set_leaf(leaf)
    }

    async fn mark_pruned(
        &self,
        marks: Vec<PruneMark>,
        pruned_at: DateTime<Utc>,
    ) -> EntryStoreResult<()> {
        self.lock()?.mark_pruned(marks, pruned_at)
    }
}
