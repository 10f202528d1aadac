#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::errors::SourceError;
use crate::event::EventTime;

pub use memory::{MemoryLogReader, PartitionedLog};

/// A record read from one partition of the ingress log, regardless of whether
/// the log is Kafka, Event Hubs, or the in-process log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// partition or shard ID
    pub partition: u32,
    /// sequence number within the partition, dense and increasing
    pub offset: u64,
    /// raw payload of the message e.g. kafka message body
    pub payload: Vec<u8>,
    /// ingestion time assigned by the log
    pub appended_at: EventTime,
}

/// A cursor over one partition owned by one consumer group.
///
/// Cursors of different groups never share state, so one group's pace never
/// affects another's.
pub trait LogReader: Send {
    fn partition(&self) -> u32;

    fn group(&self) -> &str;

    /// Offset of the next record `read_batch` will return.
    fn position(&self) -> u64;

    /// Moves the cursor, typically to a committed checkpoint on startup.
    fn seek(&mut self, offset: u64) -> Result<(), SourceError>;

    /// Returns up to `max` records in append order, starting at `position()`.
    ///
    /// Blocks until at least one record is available. Returns
    /// [`SourceError::Cancelled`] once `cancel` fires, and
    /// [`SourceError::RetentionExceeded`] if the cursor points at records the
    /// log no longer retains.
    fn read_batch(
        &mut self,
        max: usize,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<LogRecord>, SourceError>> + Send;
}
