// src/store/mod.rs

//! Persistence of execution state across restarts.
//!
//! One [`ExecutionRecord`] per execution holds everything needed to rebuild
//! the scheduler and the channel registry: graph, task run states, channel
//! and slot records, and the slot-to-channel wiring.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::ChannelRecords;
use crate::dag::{Graph, TaskRecord};
use crate::engine::{ExecutionStatus, Wiring};
use crate::types::ExecutionId;

/// Persisted state of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution: ExecutionId,
    pub graph: Graph,
    pub parallelism: usize,
    pub tasks: Vec<TaskRecord>,
    pub channels: ChannelRecords,
    pub wiring: Wiring,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

/// Abstract store for execution records.
pub trait StateStore: Send + Sync + Debug {
    fn save(&self, record: &ExecutionRecord) -> Result<()>;
    fn load(&self, execution: &str) -> Result<Option<ExecutionRecord>>;
    /// Every stored record, sorted by execution id.
    fn load_all(&self) -> Result<Vec<ExecutionRecord>>;
    fn remove(&self, execution: &str) -> Result<()>;
}

/// Records kept in process memory. Survives a scheduler restart as long as
/// the same store value is handed to the new scheduler.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, record: &ExecutionRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.execution.clone(), record.clone());
        Ok(())
    }

    fn load(&self, execution: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution)
            .cloned())
    }

    fn load_all(&self) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let sorted: BTreeMap<_, _> = records.iter().collect();
        Ok(sorted.into_values().cloned().collect())
    }

    fn remove(&self, execution: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution);
        Ok(())
    }
}

/// Stores each record as `<dir>/<execution>.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, execution: &str) -> PathBuf {
        self.dir.join(format!("{execution}.json"))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, record: &ExecutionRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("creating dir {:?}", self.dir))?;
        let path = self.path_for(&record.execution);
        let json = serde_json::to_vec_pretty(record).context("serializing execution record")?;

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).with_context(|| format!("creating file {:?}", tmp))?;
        file.write_all(&json)
            .with_context(|| format!("writing to file {:?}", tmp))?;
        file.sync_all().with_context(|| format!("syncing file {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming {:?} to {:?}", tmp, path))?;

        debug!(execution = %record.execution, path = ?path, "execution record saved");
        Ok(())
    }

    fn load(&self, execution: &str) -> Result<Option<ExecutionRecord>> {
        let path = self.path_for(execution);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("reading file {:?}", path))?;
        let record = serde_json::from_slice(&bytes).with_context(|| format!("parsing {:?}", path))?;
        Ok(Some(record))
    }

    fn load_all(&self) -> Result<Vec<ExecutionRecord>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("reading dir {:?}", self.dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).with_context(|| format!("reading file {:?}", path))?;
            match serde_json::from_slice::<ExecutionRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = ?path, error = %err, "skipping unreadable execution record"),
            }
        }
        records.sort_by(|a, b| a.execution.cmp(&b.execution));
        Ok(records)
    }

    fn remove(&self, execution: &str) -> Result<()> {
        let path = self.path_for(execution);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing file {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::TaskSpec;

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord {
            execution: id.to_string(),
            graph: Graph::new("g").with_task(TaskSpec::new("A", "true")),
            parallelism: 2,
            tasks: Vec::new(),
            channels: ChannelRecords::default(),
            wiring: Wiring::default(),
            status: ExecutionStatus::Running,
            error: None,
            cancel_requested: false,
        }
    }

    #[test]
    fn file_store_round_trips_and_lists_sorted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStateStore::new(dir.path().join("state"));
        assert!(store.load_all()?.is_empty());

        store.save(&record("exec-b"))?;
        store.save(&record("exec-a"))?;
        assert_eq!(store.load("exec-a")?, Some(record("exec-a")));

        let ids: Vec<_> = store.load_all()?.into_iter().map(|r| r.execution).collect();
        assert_eq!(ids, vec!["exec-a", "exec-b"]);

        store.remove("exec-a")?;
        store.remove("exec-a")?;
        assert_eq!(store.load("exec-a")?, None);
        Ok(())
    }

    #[test]
    fn memory_store_overwrites_by_execution() -> Result<()> {
        let store = MemoryStateStore::new();
        let mut r = record("e1");
        store.save(&r)?;
        r.status = ExecutionStatus::Completed;
        store.save(&r)?;
        assert_eq!(store.load_all()?.len(), 1);
        assert_eq!(store.load("e1")?.map(|r| r.status), Some(ExecutionStatus::Completed));
        Ok(())
    }
}
