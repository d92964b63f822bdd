use crate::memory::{MemoryEntryStore, MemoryState};
use crate::store::{EntryStore, EntryStoreError, EntryStoreResult, PruneMark};
use crate::types::{EntryIndex, EntryKind, SessionEntry, SessionHeader};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One line of a session file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Header(SessionHeader),
    Entry(SessionEntry),
    Leaf { index: Option<EntryIndex> },
}

/// Session log persisted as JSON lines next to an in-memory mirror.
///
/// The first line is the header. Appends and leaf moves are appended as single
/// lines; pruning rewrites the whole file through a temporary sibling.
#[derive(Clone, Debug)]
pub struct FsEntryStore {
    path: PathBuf,
    inner: MemoryEntryStore,
}

impl FsEntryStore {
    /// Open `path`, creating it with a fresh header when missing.
    pub fn open<P: AsRef<Path>>(path: P) -> EntryStoreResult<Self> {
        Self::open_with_header(path, SessionHeader::new())
    }

    pub fn open_with_header<P: AsRef<Path>>(
        path: P,
        header: SessionHeader,
    ) -> EntryStoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| EntryStoreError::Io(format!("create session dir failed: {err}")))?;
        }

        let state = if path.exists() {
            load_state(&path)?
        } else {
            let state = MemoryState::with_header(header);
            write_snapshot(&path, &state)?;
            state
        };
        debug!(path = %path.display(), entries = state.entries.len(), "opened session file");

        Ok(Self {
            path,
            inner: MemoryEntryStore::from_state(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_record(&self, record: &Record) -> EntryStoreResult<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|err| EntryStoreError::Serialization(err.to_string()))?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| EntryStoreError::Io(format!("open session file failed: {err}")))?;
        file.write_all(&line)
            .map_err(|err| EntryStoreError::Io(format!("append session file failed: {err}")))
    }
}

fn load_state(path: &Path) -> EntryStoreResult<MemoryState> {
    let raw = fs::read_to_string(path)
        .map_err(|err| EntryStoreError::Io(format!("read session file failed: {err}")))?;
    let mut lines = raw.lines().filter(|line| !line.trim().is_empty());

    let header = match lines.next().map(serde_json::from_str::<Record>) {
        Some(Ok(Record::Header(header))) => header,
        Some(Ok(_)) | None => {
            return Err(EntryStoreError::InvalidInput(format!(
                "session file {} does not start with a header",
                path.display()
            )));
        }
        Some(Err(err)) => return Err(EntryStoreError::Serialization(err.to_string())),
    };

    let mut state = MemoryState::with_header(header);
    for (line_no, line) in lines.enumerate() {
        match serde_json::from_str::<Record>(line) {
            Ok(Record::Entry(entry)) => {
                if entry.index != state.entries.len() {
                    return Err(EntryStoreError::InvalidInput(format!(
                        "entry index {} out of order (expected {})",
                        entry.index,
                        state.entries.len()
                    )));
                }
                state.entries.push(entry);
            }
            Ok(Record::Leaf { index }) => state.set_leaf(index)?,
            Ok(Record::Header(_)) => {
                warn!(line = line_no + 2, "ignoring repeated session header");
            }
            // A torn final write leaves a partial line behind.
            Err(err) => warn!(line = line_no + 2, error = %err, "skipping unreadable session line"),
        }
    }
    Ok(state)
}

fn write_snapshot(path: &Path, state: &MemoryState) -> EntryStoreResult<()> {
    let mut raw = Vec::new();
    let mut push = |record: &Record| -> EntryStoreResult<()> {
        serde_json::to_writer(&mut raw, record)
            .map_err(|err| EntryStoreError::Serialization(err.to_string()))?;
        raw.push(b'\n');
        Ok(())
    };
    push(&Record::Header(state.header.clone()))?;
    for entry in &state.entries {
        push(&Record::Entry(entry.clone()))?;
    }
    if state.leaf.is_some() {
        push(&Record::Leaf { index: state.leaf })?;
    }

    let tmp = path.with_extension("jsonl.tmp");
    fs::write(&tmp, raw)
        .map_err(|err| EntryStoreError::Io(format!("write session file failed: {err}")))?;
    fs::rename(&tmp, path)
        .map_err(|err| EntryStoreError::Io(format!("rename session file failed: {err}")))?;
    Ok(())
}

#[async_trait::async_trait]
impl EntryStore for FsEntryStore {
    async fn header(&self) -> EntryStoreResult<SessionHeader> {
        self.inner.header().await
    }

    async fn entries(&self) -> EntryStoreResult<Vec<SessionEntry>> {
        self.inner.entries().await
    }

    async fn entry(&self, index: EntryIndex) -> EntryStoreResult<SessionEntry> {
        self.inner.entry(index).await
    }

    async fn leaf(&self) -> EntryStoreResult<Option<EntryIndex>> {
        self.inner.leaf().await
    }

    async fn append(
        &self,
        parent: Option<EntryIndex>,
        kind: EntryKind,
    ) -> EntryStoreResult<SessionEntry> {
        let mut state = self.inner.lock()?;
        let entry = state.append(parent, kind)?;
        if let Err(err) = self.append_record(&Record::Entry(entry.clone())) {
            state.entries.pop();
            return Err(err);
        }
        Ok(entry)
    }

    async fn set_leaf(&self, leaf: Option<EntryIndex>) -> EntryStoreResult<()> {
        let mut state = self.inner.lock()?;
        let previous = state.leaf;
        state.set_leaf(leaf)?;
        if let Err(err) = self.append_record(&Record::Leaf { index: leaf }) {
            state.leaf = previous;
            return Err(err);
        }
        Ok(())
    }

    async fn mark_pruned(
        &self,
        marks: Vec<PruneMark>,
        pruned_at: DateTime<Utc>,
    ) -> EntryStoreResult<()> {
        let mut state = self.inner.lock()?;
        let before = state.clone();
        state.mark_pruned(marks, pruned_at)?;
        if let Err(err) = write_snapshot(&self.path, &state) {
            *state = before;
            return Err(err);
        }
        Ok(())
    }
}
