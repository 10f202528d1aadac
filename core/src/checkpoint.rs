//! Per (partition, consumer group) committed read positions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::CheckpointError;
use crate::event::EventTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition: u32,
    pub group: String,
    /// Next offset to read on restart. Every record below it is fully settled.
    pub offset: u64,
    /// Emission frontier at commit time. Windows emitted below it are not
    /// emitted again on replay.
    pub frontier: Option<EventTime>,
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self, partition: u32, group: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    fn commit(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<(u32, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, partition: u32, group: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.lock().map_err(|e| CheckpointError::Load {
            partition,
            group: group.to_string(),
            reason: e.to_string(),
        })?;
        Ok(checkpoints.get(&(partition, group.to_string())).cloned())
    }

    fn commit(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.lock().map_err(|e| CheckpointError::Commit {
            partition: checkpoint.partition,
            group: checkpoint.group.clone(),
            reason: e.to_string(),
        })?;
        checkpoints.insert(
            (checkpoint.partition, checkpoint.group.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }
}

/// One JSON file per (group, partition) in a directory. Commits write a
/// temporary file and rename it over the old one.
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|e| CheckpointError::Commit {
            partition: 0,
            group: String::new(),
            reason: format!("cannot create {}: {e}", directory.display()),
        })?;
        Ok(Self { directory })
    }

    fn path(&self, partition: u32, group: &str) -> PathBuf {
        self.directory.join(format!("{group}-{partition}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, partition: u32, group: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let fail = |reason: String| CheckpointError::Load {
            partition,
            group: group.to_string(),
            reason,
        };
        let content = match std::fs::read_to_string(self.path(partition, group)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(fail(e.to_string())),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| fail(e.to_string()))
    }

    fn commit(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let fail = |reason: String| CheckpointError::Commit {
            partition: checkpoint.partition,
            group: checkpoint.group.clone(),
            reason,
        };
        let target = self.path(checkpoint.partition, &checkpoint.group);
        let staging = target.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(checkpoint).map_err(|e| fail(e.to_string()))?;
        std::fs::write(&staging, content).map_err(|e| fail(e.to_string()))?;
        std::fs::rename(&staging, &target).map_err(|e| fail(e.to_string()))
    }
}

/// Commits one pipeline's position, at most once per interval unless forced.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    partition: u32,
    group: String,
    interval: Duration,
    last_commit: Option<Instant>,
    committed: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        partition: u32,
        group: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            partition,
            group: group.into(),
            interval,
            last_commit: None,
            committed: None,
        }
    }

    pub fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoint = self.store.load(self.partition, &self.group)?;
        if let Some(checkpoint) = &checkpoint {
            info!(
                partition = self.partition,
                group = %self.group,
                offset = checkpoint.offset,
                "resuming from checkpoint"
            );
        }
        self.committed = checkpoint.clone();
        Ok(checkpoint)
    }

    pub fn committed(&self) -> Option<&Checkpoint> {
        self.committed.as_ref()
    }

    /// Commits if the interval has elapsed since the last commit. Returns
    /// whether a commit happened.
    pub fn maybe_commit(&mut self, offset: u64, frontier: Option<EventTime>) -> Result<bool, CheckpointError> {
        let due = self
            .last_commit
            .is_none_or(|at| at.elapsed() >= self.interval);
        if !due {
            return Ok(false);
        }
        self.commit(offset, frontier)
    }

    /// Commits now, unless nothing moved since the last commit.
    pub fn commit(&mut self, offset: u64, frontier: Option<EventTime>) -> Result<bool, CheckpointError> {
        let (offset, frontier) = match &self.committed {
            Some(prev) => (
                prev.offset.max(offset),
                match (prev.frontier, frontier) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                },
            ),
            None => (offset, frontier),
        };
        if self
            .committed
            .as_ref()
            .is_some_and(|prev| prev.offset == offset && prev.frontier == frontier)
        {
            return Ok(false);
        }

        let checkpoint = Checkpoint {
            partition: self.partition,
            group: self.group.clone(),
            offset,
            frontier,
        };
        self.store.commit(&checkpoint)?;
        debug!(partition = self.partition, group = %self.group, offset, ?frontier, "checkpoint committed");
        self.committed = Some(checkpoint);
        self.last_commit = Some(Instant::now());
        Ok(true)
    }
}
