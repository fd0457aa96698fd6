//! Checkpoint persistence (spec.md §4.4): self-contained per-`(run_id,
//! superstep)` state snapshots, storage-agnostic so the same engine drives
//! both the standalone CLI (file-backed) and the orchestrator (Postgres).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A single reducer-applied write, recorded for the run-details trace
/// (spec.md §6, `GET /workflows/{id}/run-details`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Write {
    pub kind: WriteKind,
    pub channel: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    NodeOutput,
    CycleOutput,
}

/// Where inside the graph a HITL suspension is parked, so resume can
/// re-enter exactly the right node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HitlLocation {
    TopLevel { index: usize },
    InCycle {
        cycle_index: usize,
        node_index: usize,
    },
}

/// A suspended HITL node awaiting `resume_payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingHitl {
    pub node: String,
    pub correlation: BTreeMap<String, Value>,
    pub location: HitlLocation,
}

/// Internal progress of a cycle that has not yet terminated — persisted so
/// cancellation or a HITL suspension between iterations can resume without
/// re-running prior iterations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CycleProgress {
    pub iteration: u32,
    pub internal_channels: BTreeMap<String, Value>,
}

/// Run-level outcome encoded alongside each checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    NeedsInput,
    Succeeded,
    Failed,
    Canceled,
}

/// A full snapshot of a run's state at a superstep boundary. Self-contained:
/// no external references, everything an engine needs to resume lives here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub run_id: Uuid,
    pub superstep: u64,
    pub channels: BTreeMap<String, Value>,
    /// Top-level node/cycle indices not yet executed.
    pub pending: BTreeSet<usize>,
    /// Iterations consumed by each cycle, keyed by cycle name. Retained for
    /// terminated cycles too, as an audit trail.
    pub cycle_iterations: BTreeMap<String, u32>,
    /// Present only while a cycle is mid-flight (suspended between
    /// iterations by cancellation or nested HITL).
    pub cycle_progress: BTreeMap<String, CycleProgress>,
    pub pending_hitl: Option<PendingHitl>,
    /// Writes applied since the previous checkpoint.
    pub writes: Vec<Write>,
    pub status: RunPhase,
    pub error: Option<String>,
    pub result: Option<BTreeMap<String, Value>>,
}

impl Snapshot {
    pub fn initial(run_id: Uuid, pending: BTreeSet<usize>, channels: BTreeMap<String, Value>) -> Self {
        Self {
            run_id,
            superstep: 0,
            channels,
            pending,
            cycle_iterations: BTreeMap::new(),
            cycle_progress: BTreeMap::new(),
            pending_hitl: None,
            writes: Vec::new(),
            status: RunPhase::Running,
            error: None,
            result: None,
        }
    }
}

/// Errors from checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("checkpoint not found for run {0}")]
    NotFound(Uuid),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Storage-agnostic checkpoint persistence. `save` appends; the latest
/// snapshot for a run is always the authoritative resume point.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    async fn list(&self, run_id: Uuid) -> Result<Vec<Snapshot>, StoreError>;
}

/// In-memory checkpoint store. Used for tests and for the in-process
/// orchestrator examples; not durable across process restarts.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    snapshots: RwLock<BTreeMap<Uuid, Vec<Snapshot>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.entry(snapshot.run_id).or_default().push(snapshot);
        Ok(())
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&run_id).and_then(|v| v.last().cloned()))
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&run_id).cloned().unwrap_or_default())
    }
}

/// Single-file embedded checkpoint store for standalone `runner` CLI
/// invocations. One file per run, holding a JSON array of snapshots in
/// superstep order; rewritten wholesale on every `save` (snapshots are
/// small JSON documents, not a high-volume append target in CLI usage).
pub struct FileCheckpointStore {
    dir: PathBuf,
    cache: RwLock<BTreeMap<Uuid, Vec<Snapshot>>>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<Snapshot>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let run_id = snapshot.run_id;
        let mut cache = self.cache.write().await;
        let entry = match cache.get(&run_id) {
            Some(existing) => existing.clone(),
            None => self.read_file(&self.path_for(run_id)).await?,
        };
        let mut entry = entry;
        entry.push(snapshot);

        let encoded = serde_json::to_vec_pretty(&entry)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::write(self.path_for(run_id), encoded)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        cache.insert(run_id, entry);
        Ok(())
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let cached = { self.cache.read().await.get(&run_id).cloned() };
        let snapshots = match cached {
            Some(s) => s,
            None => self.read_file(&self.path_for(run_id)).await?,
        };
        Ok(snapshots.into_iter().last())
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<Snapshot>, StoreError> {
        let cached = { self.cache.read().await.get(&run_id).cloned() };
        match cached {
            Some(s) => Ok(s),
            None => self.read_file(&self.path_for(run_id)).await,
        }
    }
}

/// Convenience alias used by callers that only need a shared, cloneable
/// handle to whichever backend was configured.
pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(run_id: Uuid, superstep: u64) -> Snapshot {
        let mut s = Snapshot::initial(run_id, BTreeSet::new(), BTreeMap::new());
        s.superstep = superstep;
        s
    }

    #[tokio::test]
    async fn in_memory_store_returns_latest() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        store.save(sample(run_id, 0)).await.unwrap();
        store.save(sample(run_id, 1)).await.unwrap();

        let latest = store.load_latest(run_id).await.unwrap().unwrap();
        assert_eq!(latest.superstep, 1);
        assert_eq!(store.list(run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_store_round_trips_across_instances() {
        let dir = std::env::temp_dir().join(format!("wirl-test-{}", Uuid::now_v7()));
        let run_id = Uuid::now_v7();
        {
            let store = FileCheckpointStore::new(&dir);
            store.save(sample(run_id, 0)).await.unwrap();
            store.save(sample(run_id, 1)).await.unwrap();
        }
        {
            // Fresh instance, empty in-memory cache: must read from disk.
            let store = FileCheckpointStore::new(&dir);
            let latest = store.load_latest(run_id).await.unwrap().unwrap();
            assert_eq!(latest.superstep, 1);
            assert_eq!(store.list(run_id).await.unwrap().len(), 2);
        }
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
