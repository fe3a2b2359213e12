//! Append-only event log with optimistic concurrency.
//!
//! Two backends share one contract:
//! - `InMemoryEventLog` for tests and single-process benches
//! - `FileEventLog`, newline-delimited JSON (JSONL) per run, easy to inspect
//!
//! Appends carry the caller's view of the tail (`expected_last_seq`). If the
//! tail moved, the append fails with `ConcurrentAppendConflict` and nothing is
//! written. Events whose idempotency key is already present are dropped, so a
//! retried orchestrator pass never duplicates history.

use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::{Event, EventKind, RunKey};

use super::error::LogError;

/// Ordered, immutable snapshot of a run's events.
///
/// Cheap to clone and can be iterated any number of times.
#[derive(Debug, Clone, Default)]
pub struct History {
    events: Arc<Vec<Event>>,
}

impl History {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: Arc::new(events),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sequence number of the tail (0 for an empty history)
    pub fn last_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }

    pub fn contains_key(&self, idempotency_key: &str) -> bool {
        self.events
            .iter()
            .any(|e| e.idempotency_key == idempotency_key)
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Result of a successful append
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// Tail sequence number after the append
    pub last_seq: u64,

    /// Events actually written, with their assigned sequence numbers
    pub appended: Vec<Event>,
}

/// Durable, append-only storage of workflow histories
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Create a run whose history begins with `started` (a `WorkflowStarted` event)
    async fn create_run(&self, key: &RunKey, started: Event) -> Result<Event, LogError>;

    /// Append events if the tail still equals `expected_last_seq`
    async fn append(
        &self,
        key: &RunKey,
        expected_last_seq: u64,
        events: Vec<Event>,
    ) -> Result<AppendResult, LogError>;

    /// Read the full ordered history of a run
    async fn read_all(&self, key: &RunKey) -> Result<History, LogError>;

    /// Most recently created run for a workflow id
    async fn latest_run(&self, workflow_id: &str) -> Result<Option<RunKey>, LogError>;

    /// All runs, oldest first
    async fn list_runs(&self) -> Result<Vec<RunKey>, LogError>;
}

/// Check the expected tail, drop already-recorded keys, and assign sequence numbers
fn stage_append(
    tail: u64,
    existing_keys: &HashSet<String>,
    expected_last_seq: u64,
    events: Vec<Event>,
) -> Result<Vec<Event>, LogError> {
    if tail != expected_last_seq {
        return Err(LogError::ConcurrentAppendConflict {
            expected: expected_last_seq,
            actual: tail,
        });
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut next_seq = tail;
    let mut staged = Vec::with_capacity(events.len());

    for mut event in events {
        if existing_keys.contains(&event.idempotency_key) || !seen.insert(event.idempotency_key.clone()) {
            debug!(key = %event.idempotency_key, "Dropping duplicate event");
            continue;
        }
        next_seq += 1;
        event.seq = next_seq;
        staged.push(event);
    }

    Ok(staged)
}

fn ensure_started(key: &RunKey, started: &Event) -> Result<(), LogError> {
    if matches!(started.kind, EventKind::WorkflowStarted { .. }) && started.run_id == key.run_id {
        Ok(())
    } else {
        Err(LogError::Corrupt(format!(
            "run {} must begin with its own WorkflowStarted event",
            key
        )))
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
struct MemoryRun {
    events: Vec<Event>,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: HashMap<RunKey, MemoryRun>,
    order: Vec<RunKey>,
}

/// Event log held in process memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventLog {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn create_run(&self, key: &RunKey, mut started: Event) -> Result<Event, LogError> {
        ensure_started(key, &started)?;
        let mut state = self.state.write().await;
        if state.runs.contains_key(key) {
            return Err(LogError::RunAlreadyExists(key.clone()));
        }

        started.seq = 1;
        let mut run = MemoryRun::default();
        run.keys.insert(started.idempotency_key.clone());
        run.events.push(started.clone());
        state.runs.insert(key.clone(), run);
        state.order.push(key.clone());

        Ok(started)
    }

    async fn append(
        &self,
        key: &RunKey,
        expected_last_seq: u64,
        events: Vec<Event>,
    ) -> Result<AppendResult, LogError> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(key)
            .ok_or_else(|| LogError::RunNotFound(key.clone()))?;

        let tail = run.events.last().map(|e| e.seq).unwrap_or(0);
        let staged = stage_append(tail, &run.keys, expected_last_seq, events)?;

        for event in &staged {
            run.keys.insert(event.idempotency_key.clone());
            run.events.push(event.clone());
        }

        Ok(AppendResult {
            last_seq: run.events.last().map(|e| e.seq).unwrap_or(0),
            appended: staged,
        })
    }

    async fn read_all(&self, key: &RunKey) -> Result<History, LogError> {
        let state = self.state.read().await;
        let run = state
            .runs
            .get(key)
            .ok_or_else(|| LogError::RunNotFound(key.clone()))?;
        Ok(History::new(run.events.clone()))
    }

    async fn latest_run(&self, workflow_id: &str) -> Result<Option<RunKey>, LogError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .rev()
            .find(|k| k.workflow_id == workflow_id)
            .cloned())
    }

    async fn list_runs(&self) -> Result<Vec<RunKey>, LogError> {
        Ok(self.state.read().await.order.clone())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// Entry in the run index (`runs.jsonl`)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunIndexEntry {
    #[serde(flatten)]
    key: RunKey,
    created_at: DateTime<Utc>,
}

/// File-based event log using one JSONL file per run.
///
/// Layout:
/// ```text
/// {base}/runs.jsonl                               run index
/// {base}/{digest(workflow_id)}/{run_id}/events.jsonl
/// ```
///
/// Appends hold an exclusive `flock` on the run's file and `fsync` before
/// returning, so a successful append survives a process crash.
#[derive(Debug, Clone)]
pub struct FileEventLog {
    base_dir: PathBuf,
}

impl FileEventLog {
    /// Open (creating if needed) a log rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    /// Root directory of this log
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding a run's files
    pub fn run_dir(&self, key: &RunKey) -> PathBuf {
        self.base_dir
            .join(workflow_dir_name(&key.workflow_id))
            .join(key.run_id.to_string())
    }

    /// Path to a run's events.jsonl
    pub fn events_path(&self, key: &RunKey) -> PathBuf {
        self.run_dir(key).join("events.jsonl")
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("runs.jsonl")
    }

    async fn read_index(&self) -> Result<Vec<RunIndexEntry>, LogError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        parse_jsonl(&content)
    }
}

/// Filesystem-safe directory name for an arbitrary workflow id
/// (first 16 hex chars of its SHA256)
pub fn workflow_dir_name(workflow_id: &str) -> String {
    let digest = Sha256::digest(workflow_id.as_bytes());
    hex::encode(&digest[..8])
}

/// Parse JSONL content.
///
/// A final line without a trailing newline is an interrupted write and is
/// ignored; any other unparsable line means the file is corrupt.
fn parse_jsonl<T: serde::de::DeserializeOwned>(content: &str) -> Result<Vec<T>, LogError> {
    let complete = match content.rfind('\n') {
        Some(pos) => &content[..=pos],
        None => "",
    };
    if complete.len() < content.len() {
        warn!("Ignoring torn trailing line in event log");
    }

    let mut items = Vec::new();
    for line in complete.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(line)
            .map_err(|e| LogError::Corrupt(format!("{}: {}", e, line)))?;
        items.push(item);
    }
    Ok(items)
}

/// Append JSONL lines to `path` under an exclusive lock.
///
/// `stage` receives the currently committed lines and returns the lines to
/// write; it runs while the lock is held so check-and-write is atomic.
fn locked_append<T, R, F>(path: &Path, stage: F) -> Result<R, LogError>
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(Vec<T>) -> Result<(Vec<String>, R), LogError>,
{
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    file.lock_exclusive()?;
    let result = append_while_locked(&mut file, path, stage);
    let _ = file.unlock();

    result
}

fn append_while_locked<T, R, F>(file: &mut std::fs::File, path: &Path, stage: F) -> Result<R, LogError>
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(Vec<T>) -> Result<(Vec<String>, R), LogError>,
{
    let content = std::fs::read_to_string(path)?;

    // Drop a torn tail so the next line starts cleanly
    let committed_len = content.rfind('\n').map(|p| p + 1).unwrap_or(0);
    if committed_len < content.len() {
        file.set_len(committed_len as u64)?;
        file.seek(SeekFrom::End(0))?;
    }

    let existing = parse_jsonl(&content)?;
    let (lines, result) = stage(existing)?;
    if !lines.is_empty() {
        let mut buf = String::new();
        for line in lines {
            buf.push_str(&line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
    }
    Ok(result)
}

async fn blocking<R, F>(f: F) -> Result<R, LogError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, LogError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LogError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn create_run(&self, key: &RunKey, mut started: Event) -> Result<Event, LogError> {
        ensure_started(key, &started)?;
        let run_dir = self.run_dir(key);
        fs::create_dir_all(&run_dir).await?;

        started.seq = 1;
        let events_path = self.events_path(key);
        let line = serde_json::to_string(&started)?;
        let conflict_key = key.clone();
        blocking(move || {
            locked_append::<Event, _, _>(&events_path, |existing| {
                if !existing.is_empty() {
                    return Err(LogError::RunAlreadyExists(conflict_key));
                }
                Ok((vec![line], ()))
            })
        })
        .await?;

        let entry = RunIndexEntry {
            key: key.clone(),
            created_at: started.timestamp,
        };
        let index_line = serde_json::to_string(&entry)?;
        let index_path = self.index_path();
        blocking(move || {
            locked_append::<RunIndexEntry, _, _>(&index_path, |_| Ok((vec![index_line], ())))
        })
        .await?;

        debug!(run = %key, "Created run log");
        Ok(started)
    }

    async fn append(
        &self,
        key: &RunKey,
        expected_last_seq: u64,
        events: Vec<Event>,
    ) -> Result<AppendResult, LogError> {
        let events_path = self.events_path(key);
        if !events_path.exists() {
            return Err(LogError::RunNotFound(key.clone()));
        }

        blocking(move || {
            locked_append::<Event, _, _>(&events_path, |existing| {
                let tail = existing.last().map(|e| e.seq).unwrap_or(0);
                let keys: HashSet<String> =
                    existing.into_iter().map(|e| e.idempotency_key).collect();
                let staged = stage_append(tail, &keys, expected_last_seq, events)?;

                let lines = staged
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<Result<Vec<_>, _>>()?;
                let last_seq = staged.last().map(|e| e.seq).unwrap_or(tail);

                Ok((
                    lines,
                    AppendResult {
                        last_seq,
                        appended: staged,
                    },
                ))
            })
        })
        .await
    }

    async fn read_all(&self, key: &RunKey) -> Result<History, LogError> {
        let events_path = self.events_path(key);
        if !events_path.exists() {
            return Err(LogError::RunNotFound(key.clone()));
        }
        let content = fs::read_to_string(&events_path).await?;
        Ok(History::new(parse_jsonl(&content)?))
    }

    async fn latest_run(&self, workflow_id: &str) -> Result<Option<RunKey>, LogError> {
        let index = self.read_index().await?;
        Ok(index
            .into_iter()
            .rev()
            .find(|e| e.key.workflow_id == workflow_id)
            .map(|e| e.key))
    }

    async fn list_runs(&self) -> Result<Vec<RunKey>, LogError> {
        Ok(self.read_index().await?.into_iter().map(|e| e.key).collect())
    }
}
