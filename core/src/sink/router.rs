use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::OutputErrorPolicy;
use crate::dead_letter::{DeadLetterHandler, DeadLetterReason, DeadLetterRecord};
use crate::errors::SinkError;
use crate::event::{Event, format_time};
use crate::retry::{RetriesExhausted, RetryPolicy};
use crate::sink::archive::{archive_path, raw_archive_line};
use crate::sink::document::{processed_event_document, processed_event_id};
use crate::sink::{SinkHandle, SinkRegistry};
use crate::source::LogRecord;
use crate::window::AggregateResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Written,
    /// Retries ran out; the payload went to the dead-letter log instead.
    DeadLettered,
}

/// Writes one pipeline's output to its sinks.
///
/// Each write is retried per the [`RetryPolicy`]. What happens once retries
/// are exhausted depends on the [`OutputErrorPolicy`].
pub struct OutputRouter {
    sinks: SinkRegistry,
    retry: RetryPolicy,
    dead_letter: DeadLetterHandler,
    policy: OutputErrorPolicy,
    ceiling: u32,
    group: String,
    consecutive_failures: u32,
    dead_letter_failures: u64,
}

fn result_document(result: &AggregateResult, id: &str) -> Result<Value, serde_json::Error> {
    let mut document = serde_json::to_value(result)?;
    if let Value::Object(object) = &mut document {
        object.insert("id".to_string(), Value::String(id.to_string()));
        object.insert(
            "window_start_time".to_string(),
            Value::String(format_time(result.window_start)),
        );
        object.insert(
            "window_end_time".to_string(),
            Value::String(format_time(result.window_end)),
        );
    }
    Ok(document)
}

impl OutputRouter {
    pub fn new(
        sinks: SinkRegistry,
        retry: RetryPolicy,
        dead_letter: DeadLetterHandler,
        policy: OutputErrorPolicy,
        ceiling: u32,
        group: impl Into<String>,
    ) -> Self {
        Self {
            sinks,
            retry,
            dead_letter,
            policy,
            ceiling,
            group: group.into(),
            consecutive_failures: 0,
            dead_letter_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Dead-letter writes that failed since the last call.
    pub fn take_dead_letter_failures(&mut self) -> u64 {
        std::mem::take(&mut self.dead_letter_failures)
    }

    /// Upserts (document store) or appends (archive) one result.
    ///
    /// `source_offset` is the read position the result is attributed to if it
    /// has to be dead-lettered.
    pub async fn write_result(
        &mut self,
        sink_id: &str,
        result: &AggregateResult,
        source_offset: u64,
    ) -> Result<Delivery, SinkError> {
        let handle = self.sinks.get(sink_id)?.clone();
        let serialization = |e: serde_json::Error| SinkError::Write {
            sink: sink_id.to_string(),
            reason: e.to_string(),
        };

        let outcome = match &handle {
            SinkHandle::Document {
                store,
                container,
                ttl_ms,
            } => {
                let id = result.document_id();
                let document = result_document(result, &id).map_err(serialization)?;
                let expires_at = ttl_ms.map(|ttl| result.window_end + ttl);
                let store = store.as_ref();
                let (container, id) = (container.as_str(), id.as_str());
                self.retry
                    .run(sink_id, move |_| {
                        store.upsert(container, id, document.clone(), expires_at)
                    })
                    .await
            }
            SinkHandle::Archive { store, topic } => {
                let path = archive_path(topic, result.window_end, result.partition);
                let mut line = serde_json::to_vec(result).map_err(serialization)?;
                line.push(b'\n');
                let store = store.as_ref();
                let (path, line) = (path.as_str(), line.as_slice());
                self.retry
                    .run(sink_id, move |_| store.append(path, line))
                    .await
            }
        };

        match outcome {
            Ok(()) => {
                self.consecutive_failures = 0;
                debug!(sink = sink_id, spec = %result.spec_id, key = %result.key, window_end = result.window_end, "result written");
                Ok(Delivery::Written)
            }
            Err(exhausted) => {
                let payload = serde_json::to_vec(result).map_err(serialization)?;
                self.exhausted(
                    sink_id,
                    exhausted,
                    vec![(payload, result.partition, source_offset)],
                )
                .await
            }
        }
    }

    /// Upserts one validated event, enriched with processing metadata, into a
    /// document store sink.
    pub async fn write_event(
        &mut self,
        sink_id: &str,
        event: &Event,
        record: &LogRecord,
    ) -> Result<Delivery, SinkError> {
        let handle = self.sinks.get(sink_id)?.clone();
        let SinkHandle::Document {
            store,
            container,
            ttl_ms,
        } = &handle
        else {
            return Err(SinkError::Write {
                sink: sink_id.to_string(),
                reason: "processed events can only go to a document store sink".to_string(),
            });
        };

        let id = processed_event_id(event, record.partition, record.offset);
        let document = processed_event_document(
            event,
            &id,
            record.partition,
            record.offset,
            chrono::Utc::now().timestamp_millis(),
        );
        let expires_at = ttl_ms.map(|ttl| event.event_time.saturating_add(ttl));
        let store = store.as_ref();
        let (container, id) = (container.as_str(), id.as_str());
        let outcome = self
            .retry
            .run(sink_id, move |_| store.upsert(container, id, document.clone(), expires_at))
            .await;

        match outcome {
            Ok(()) => {
                self.consecutive_failures = 0;
                debug!(sink = sink_id, id, offset = record.offset, "event written");
                Ok(Delivery::Written)
            }
            Err(exhausted) => {
                self.exhausted(
                    sink_id,
                    exhausted,
                    vec![(record.payload.clone(), record.partition, record.offset)],
                )
                .await
            }
        }
    }

    /// Appends raw ingress records to an archive sink, bucketed by arrival
    /// date and hour.
    pub async fn archive_raw(
        &mut self,
        sink_id: &str,
        records: &[LogRecord],
    ) -> Result<Delivery, SinkError> {
        let handle = self.sinks.get(sink_id)?.clone();
        let SinkHandle::Archive { store, topic } = &handle else {
            return Err(SinkError::Write {
                sink: sink_id.to_string(),
                reason: "raw records can only go to an archive sink".to_string(),
            });
        };

        let mut objects: BTreeMap<String, (Vec<u8>, Vec<&LogRecord>)> = BTreeMap::new();
        for record in records {
            let (bytes, members) = objects
                .entry(archive_path(topic, record.appended_at, record.partition))
                .or_default();
            bytes.extend(raw_archive_line(record));
            members.push(record);
        }

        let mut delivery = Delivery::Written;
        for (path, (bytes, members)) in &objects {
            let store = store.as_ref();
            let (path, bytes) = (path.as_str(), bytes.as_slice());
            match self.retry.run(sink_id, move |_| store.append(path, bytes)).await {
                Ok(()) => {
                    self.consecutive_failures = 0;
                    debug!(sink = sink_id, path, records = members.len(), "raw records archived");
                }
                Err(exhausted) => {
                    let payloads = members
                        .iter()
                        .map(|r| (r.payload.clone(), r.partition, r.offset))
                        .collect();
                    delivery = self.exhausted(sink_id, exhausted, payloads).await?;
                }
            }
        }
        Ok(delivery)
    }

    async fn exhausted(
        &mut self,
        sink_id: &str,
        exhausted: RetriesExhausted<anyhow::Error>,
        payloads: Vec<(Vec<u8>, u32, u64)>,
    ) -> Result<Delivery, SinkError> {
        let reason = exhausted.last_error.to_string();
        match self.policy {
            OutputErrorPolicy::Stop => {
                error!(sink = sink_id, attempts = exhausted.attempts, %reason, "sink write failed, stopping");
                Err(SinkError::RetriesExhausted {
                    sink: sink_id.to_string(),
                    attempts: exhausted.attempts,
                    reason,
                })
            }
            OutputErrorPolicy::Drop => {
                for (payload, partition, offset) in payloads {
                    let record = DeadLetterRecord::new(
                        DeadLetterReason::SinkWriteFailed,
                        &payload,
                        partition,
                        offset,
                        &self.group,
                    )
                    .with_detail(format!("{sink_id}: {reason}"));
                    if !self.dead_letter.send(record).await {
                        self.dead_letter_failures += 1;
                        error!(sink = sink_id, partition, offset, "failed write lost, dead-letter log unavailable");
                    }
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures > self.ceiling {
                    error!(
                        sink = sink_id,
                        failures = self.consecutive_failures,
                        ceiling = self.ceiling,
                        "sink unavailable past the failure ceiling"
                    );
                    return Err(SinkError::CeilingExceeded {
                        failures: self.consecutive_failures,
                        ceiling: self.ceiling,
                    });
                }
                warn!(
                    sink = sink_id,
                    attempts = exhausted.attempts,
                    failures = self.consecutive_failures,
                    %reason,
                    "sink write failed, dead-lettered"
                );
                Ok(Delivery::DeadLettered)
            }
        }
    }
}
