//! Dead-letter records and the handler that writes them.
//!
//! Dead letters go to a separate, smaller log. Writing one never blocks or
//! fails the pipeline: a write that errors or times out is logged and dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::event::format_time;
use crate::source::PartitionedLog;

/// Payloads longer than this are truncated before dead-lettering.
pub const MAX_PAYLOAD_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterReason {
    ParseError,
    ValidationFailed,
    LateArrivalExceeded,
    SinkWriteFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::ParseError => "parse-error",
            DeadLetterReason::ValidationFailed => "validation-failed",
            DeadLetterReason::LateArrivalExceeded => "late-arrival-exceeded",
            DeadLetterReason::SinkWriteFailed => "sink-write-failed",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_payload: String,
    pub error_reason: DeadLetterReason,
    pub source_partition: u32,
    pub source_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub group: String,
    pub rejected_at: String,
}

impl DeadLetterRecord {
    pub fn new(
        reason: DeadLetterReason,
        payload: &[u8],
        source_partition: u32,
        source_offset: u64,
        group: &str,
    ) -> Self {
        let end = payload.len().min(MAX_PAYLOAD_BYTES);
        Self {
            original_payload: String::from_utf8_lossy(&payload[..end]).into_owned(),
            error_reason: reason,
            source_partition,
            source_offset,
            detail: None,
            group: group.to_string(),
            rejected_at: format_time(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only destination for dead letters.
pub trait DeadLetterLog: Send + Sync {
    fn append<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, anyhow::Result<()>>;
}

impl DeadLetterLog for PartitionedLog {
    fn append<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(record)?;
            let partition = record.source_partition % self.partition_count();
            self.append_now(partition, payload)?;
            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct DeadLetterHandler {
    log: Arc<dyn DeadLetterLog>,
    timeout: Duration,
}

impl DeadLetterHandler {
    pub fn new(log: Arc<dyn DeadLetterLog>, timeout: Duration) -> Self {
        Self { log, timeout }
    }

    /// Writes a dead letter. Returns whether it was delivered.
    pub async fn send(&self, record: DeadLetterRecord) -> bool {
        match tokio::time::timeout(self.timeout, self.log.append(&record)).await {
            Ok(Ok(())) => {
                debug!(
                    reason = %record.error_reason,
                    partition = record.source_partition,
                    offset = record.source_offset,
                    "dead-lettered record"
                );
                true
            }
            Ok(Err(e)) => {
                error!(
                    reason = %record.error_reason,
                    partition = record.source_partition,
                    offset = record.source_offset,
                    error = %e,
                    "dead-letter write failed, record dropped"
                );
                false
            }
            Err(_) => {
                error!(
                    reason = %record.error_reason,
                    partition = record.source_partition,
                    offset = record.source_offset,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "dead-letter write timed out, record dropped"
                );
                false
            }
        }
    }
}
