//! In-process partitioned, append-only log.
//!
//! Serves as the local ingress, as the dead-letter log, and in tests. Each
//! partition is an ordered deque of records with dense offsets; retention drops
//! records from the front and remembers the first retained offset.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::SourceError;
use crate::event::EventTime;
use crate::source::{LogReader, LogRecord};

pub struct PartitionedLog {
    name: String,
    retention_ms: u64,
    partitions: Vec<Partition>,
}

struct Partition {
    data: Mutex<PartitionData>,
    appended: Notify,
}

#[derive(Default)]
struct PartitionData {
    /// Offset of `records[0]`, or of the next append when empty.
    base_offset: u64,
    records: VecDeque<LogRecord>,
}

impl Partition {
    fn lock(&self) -> MutexGuard<'_, PartitionData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PartitionData {
    fn end_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }
}

impl PartitionedLog {
    pub fn new(name: impl Into<String>, partition_count: u32, retention_ms: u64) -> Self {
        let partitions = (0..partition_count.max(1))
            .map(|_| Partition {
                data: Mutex::new(PartitionData::default()),
                appended: Notify::new(),
            })
            .collect();
        Self {
            name: name.into(),
            retention_ms,
            partitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn partition(&self, partition: u32) -> Result<&Partition, SourceError> {
        self.partitions
            .get(partition as usize)
            .ok_or(SourceError::UnknownPartition {
                partition,
                partition_count: self.partition_count(),
            })
    }

    /// Appends a record and returns its offset.
    pub fn append(
        &self,
        partition: u32,
        payload: impl Into<Vec<u8>>,
        appended_at: EventTime,
    ) -> Result<u64, SourceError> {
        let target = self.partition(partition)?;
        let offset = {
            let mut data = target.lock();
            let offset = data.end_offset();
            data.records.push_back(LogRecord {
                partition,
                offset,
                payload: payload.into(),
                appended_at,
            });
            offset
        };
        target.appended.notify_waiters();
        Ok(offset)
    }

    /// Appends with the current wall-clock time as ingestion time.
    pub fn append_now(&self, partition: u32, payload: impl Into<Vec<u8>>) -> Result<u64, SourceError> {
        self.append(partition, payload, chrono::Utc::now().timestamp_millis())
    }

    pub fn earliest_offset(&self, partition: u32) -> Result<u64, SourceError> {
        Ok(self.partition(partition)?.lock().base_offset)
    }

    /// Offset the next append to `partition` will receive.
    pub fn end_offset(&self, partition: u32) -> Result<u64, SourceError> {
        Ok(self.partition(partition)?.lock().end_offset())
    }

    /// Copy of every retained record in a partition.
    pub fn snapshot(&self, partition: u32) -> Result<Vec<LogRecord>, SourceError> {
        Ok(self.partition(partition)?.lock().records.iter().cloned().collect())
    }

    /// Drops records appended before `now - retention`. Returns how many went.
    pub fn enforce_retention(&self, now: EventTime) -> usize {
        let horizon = now.saturating_sub(self.retention_ms as i64);
        let mut removed = 0;
        for (index, partition) in self.partitions.iter().enumerate() {
            let mut data = partition.lock();
            let before = removed;
            while data
                .records
                .front()
                .is_some_and(|record| record.appended_at < horizon)
            {
                data.records.pop_front();
                data.base_offset += 1;
                removed += 1;
            }
            if removed > before {
                debug!(log = %self.name, partition = index, base_offset = data.base_offset, "retention applied");
            }
        }
        if removed > 0 {
            info!(log = %self.name, removed, "expired records past retention");
        }
        removed
    }

    /// Appends every non-empty line of an NDJSON file, round-robin across
    /// partitions. Returns how many records went in.
    pub async fn replay_ndjson(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let mut lines = BufReader::new(file).lines();
        let mut appended = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let partition = (appended % self.partitions.len()) as u32;
            self.append_now(partition, line)?;
            appended += 1;
        }
        info!(log = %self.name, path = %path.as_ref().display(), records = appended, "replayed file into log");
        Ok(appended)
    }

    /// A cursor for `group` on `partition`, positioned at the earliest retained record.
    pub fn reader(
        self: &Arc<Self>,
        partition: u32,
        group: impl Into<String>,
    ) -> Result<MemoryLogReader, SourceError> {
        let next = self.earliest_offset(partition)?;
        Ok(MemoryLogReader {
            log: Arc::clone(self),
            partition,
            group: group.into(),
            next,
        })
    }
}

pub struct MemoryLogReader {
    log: Arc<PartitionedLog>,
    partition: u32,
    group: String,
    next: u64,
}

impl MemoryLogReader {
    fn try_read(&mut self, max: usize) -> Result<Vec<LogRecord>, SourceError> {
        let partition = self.log.partition(self.partition)?;
        let data = partition.lock();
        if self.next < data.base_offset {
            return Err(SourceError::RetentionExceeded {
                partition: self.partition,
                group: self.group.clone(),
                requested: self.next,
                earliest: data.base_offset,
            });
        }
        let start = (self.next - data.base_offset) as usize;
        let batch: Vec<LogRecord> = data.records.iter().skip(start).take(max).cloned().collect();
        self.next += batch.len() as u64;
        Ok(batch)
    }
}

impl LogReader for MemoryLogReader {
    fn partition(&self) -> u32 {
        self.partition
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn position(&self) -> u64 {
        self.next
    }

    fn seek(&mut self, offset: u64) -> Result<(), SourceError> {
        self.next = offset;
        Ok(())
    }

    async fn read_batch(
        &mut self,
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<LogRecord>, SourceError> {
        let log = Arc::clone(&self.log);
        let partition = log.partition(self.partition)?;
        loop {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            // Register for wakeups before looking, so an append between the
            // check and the wait is not missed.
            let notified = partition.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_read(max.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            }
        }
    }
}
