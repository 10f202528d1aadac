use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::config::{AnalyticsConfig, ConsumerGroupConfig, ProcessingConfig};
use crate::dead_letter::{DeadLetterHandler, DeadLetterReason, DeadLetterRecord};
use crate::errors::{self, ConfigError, EventError, PipelineError, SourceError};
use crate::event::Event;
use crate::reconciler::{Reconciler, ReconcilerStats, Verdict};
use crate::sink::{Delivery, OutputRouter, SinkRegistry};
use crate::source::{LogReader, LogRecord};
use crate::telemetry::PipelineMetrics;
use crate::window::{WindowAggregator, WindowSpec};

/// Shared services every pipeline writes to.
#[derive(Clone)]
pub struct PipelineServices {
    pub sinks: SinkRegistry,
    pub dead_letter: DeadLetterHandler,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// One sequential pipeline for a (partition, consumer group) pair.
///
/// Each cycle reads a batch, reconciles event time, folds released records
/// into windows, writes emitted results, and commits the settled position.
pub struct Pipeline<R: LogReader> {
    reader: R,
    partition: u32,
    group: String,
    processing: ProcessingConfig,
    archive_sink: Option<String>,
    events_sink: Option<String>,
    spec_sinks: HashMap<String, String>,
    reconciler: Reconciler,
    aggregator: WindowAggregator,
    router: OutputRouter,
    dead_letter: DeadLetterHandler,
    checkpoints: CheckpointManager,
    metrics: PipelineMetrics,
}

impl<R: LogReader> Pipeline<R> {
    pub fn from_config(
        config: &AnalyticsConfig,
        group: &ConsumerGroupConfig,
        reader: R,
        services: &PipelineServices,
    ) -> Result<Self, ConfigError> {
        let queries = group
            .queries
            .iter()
            .map(|id| {
                config.query(id).cloned().ok_or_else(|| ConfigError::Invalid {
                    message: format!("group '{}' runs unknown query '{}'", group.name, id),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let partition = reader.partition();
        let router = OutputRouter::new(
            services.sinks.clone(),
            config.retry.clone(),
            services.dead_letter.clone(),
            config.processing.output_error_policy,
            config.processing.sink_failure_ceiling,
            group.name.clone(),
        );
        let checkpoints = CheckpointManager::new(
            Arc::clone(&services.checkpoints),
            partition,
            group.name.clone(),
            Duration::from_millis(config.processing.checkpoint_interval_ms),
        );
        Ok(Self::new(
            reader,
            queries,
            group.archive_sink.clone(),
            &config.processing,
            router,
            services.dead_letter.clone(),
            checkpoints,
        )
        .with_events_sink(group.events_sink.clone()))
    }

    pub fn new(
        reader: R,
        queries: Vec<WindowSpec>,
        archive_sink: Option<String>,
        processing: &ProcessingConfig,
        router: OutputRouter,
        dead_letter: DeadLetterHandler,
        checkpoints: CheckpointManager,
    ) -> Self {
        let partition = reader.partition();
        let group = reader.group().to_string();
        let spec_sinks = queries
            .iter()
            .map(|q| (q.id.clone(), q.sink.clone()))
            .collect();
        Self {
            reader,
            partition,
            group,
            processing: processing.clone(),
            archive_sink,
            events_sink: None,
            spec_sinks,
            reconciler: Reconciler::new(processing),
            aggregator: WindowAggregator::new(
                partition,
                queries,
                processing.late_arrival_tolerance_ms,
            ),
            router,
            dead_letter,
            checkpoints,
            metrics: PipelineMetrics::default(),
        }
    }

    /// Upserts every valid event into the given document store sink.
    pub fn with_events_sink(mut self, sink: Option<String>) -> Self {
        self.events_sink = sink;
        self
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Offset of the next record to read.
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    pub fn reconciler_stats(&self) -> &ReconcilerStats {
        self.reconciler.stats()
    }

    /// Lowest offset still contributing to unsettled state, or the read
    /// position when everything read so far is settled.
    pub fn settled_position(&self) -> u64 {
        [
            self.reconciler.lowest_offset(),
            self.aggregator.lowest_unsettled_offset(),
        ]
        .into_iter()
        .flatten()
        .fold(self.reader.position(), u64::min)
    }

    /// Positions the reader at the committed checkpoint, if there is one.
    pub fn start(&mut self) -> errors::Result<()> {
        if let Some(checkpoint) = self.checkpoints.load()? {
            self.reader.seek(checkpoint.offset)?;
            if let Some(frontier) = checkpoint.frontier {
                self.aggregator.suppress_before(frontier);
            }
        } else {
            info!(
                partition = self.partition,
                group = %self.group,
                offset = self.reader.position(),
                "no checkpoint, starting at earliest retained record"
            );
        }
        Ok(())
    }

    /// Runs a single poll-process-write-commit cycle. Returns the number of
    /// records read.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> errors::Result<usize> {
        let records = self
            .reader
            .read_batch(self.processing.max_poll_records, cancel)
            .await?;
        self.metrics.batches_processed += 1;
        self.metrics.records_read += records.len() as u64;
        self.metrics.bytes_read += records.iter().map(|r| r.payload.len() as u64).sum::<u64>();

        if let Some(sink) = &self.archive_sink {
            if self.router.archive_raw(sink, &records).await? == Delivery::Written {
                self.metrics.raw_records_archived += records.len() as u64;
            }
        }

        let windowed = !self.aggregator.specs().is_empty();
        if windowed || self.events_sink.is_some() {
            for record in &records {
                self.ingest(record).await?;
            }
        }
        if windowed {
            self.emit().await?;
        }
        self.metrics.dead_letter_failures += self.router.take_dead_letter_failures();

        if self
            .checkpoints
            .maybe_commit(self.settled_position(), self.aggregator.frontier())?
        {
            self.on_commit();
        }
        Ok(records.len())
    }

    /// Validates one record, writes it to the events sink and offers it to
    /// the reconciler.
    async fn ingest(&mut self, record: &LogRecord) -> errors::Result<()> {
        let event = match Event::parse(&record.payload, record.appended_at) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.malformed_records += 1;
                let reason = match e {
                    EventError::Parse { .. } => DeadLetterReason::ParseError,
                    EventError::Validation { .. } => DeadLetterReason::ValidationFailed,
                };
                debug!(partition = self.partition, offset = record.offset, error = %e, "malformed record");
                self.send_dead_letter(reason, record, e.to_string()).await;
                return Ok(());
            }
        };

        if let Some(sink) = &self.events_sink {
            match self.router.write_event(sink, &event, record).await? {
                Delivery::Written => self.metrics.events_written += 1,
                Delivery::DeadLettered => self.metrics.events_dead_lettered += 1,
            }
        }
        if self.aggregator.specs().is_empty() {
            return Ok(());
        }

        if self.reconciler.offer(record.offset, event) == Verdict::Exceeded
            && self.processing.dead_letter_late_events
        {
            self.metrics.late_dead_lettered += 1;
            let detail = format!(
                "event time behind watermark {:?} by more than {} ms",
                self.reconciler.watermark(),
                self.processing.late_arrival_tolerance_ms
            );
            self.send_dead_letter(DeadLetterReason::LateArrivalExceeded, record, detail)
                .await;
        }
        Ok(())
    }

    async fn send_dead_letter(&mut self, reason: DeadLetterReason, record: &LogRecord, detail: String) {
        let letter = DeadLetterRecord::new(
            reason,
            &record.payload,
            record.partition,
            record.offset,
            &self.group,
        )
        .with_detail(detail);
        if !self.dead_letter.send(letter).await {
            self.metrics.dead_letter_failures += 1;
        }
    }

    /// Releases reconciled records into windows and writes whatever closes.
    async fn emit(&mut self) -> errors::Result<()> {
        for admitted in self.reconciler.release() {
            self.aggregator
                .add(admitted.offset, admitted.time, &admitted.event);
        }
        let Some(frontier) = self.reconciler.frontier() else {
            return Ok(());
        };

        let results = self.aggregator.advance(frontier);
        self.metrics.results_emitted += results.len() as u64;
        let position = self.reader.position();
        for result in &results {
            let Some(sink) = self.spec_sinks.get(&result.spec_id) else {
                continue;
            };
            match self.router.write_result(sink, result, position).await? {
                Delivery::Written => self.metrics.results_written += 1,
                Delivery::DeadLettered => self.metrics.results_dead_lettered += 1,
            }
        }
        Ok(())
    }

    fn on_commit(&mut self) {
        self.metrics.checkpoints_committed += 1;
        info!(
            partition = self.partition,
            group = %self.group,
            offset = self.checkpoints.committed().map(|c| c.offset),
            live_windows = self.aggregator.live_state(),
            buffered = self.reconciler.buffered(),
            metrics = %serde_json::to_string(&self.metrics).unwrap_or_default(),
            reconciler = %serde_json::to_string(self.reconciler.stats()).unwrap_or_default(),
            "checkpoint"
        );
    }

    /// Commits the settled position. In-flight window state is not flushed;
    /// it is rebuilt by replay from the checkpoint.
    pub fn shutdown(&mut self) -> errors::Result<()> {
        if self
            .checkpoints
            .commit(self.settled_position(), self.aggregator.frontier())?
        {
            self.on_commit();
        }
        info!(partition = self.partition, group = %self.group, "pipeline stopped");
        Ok(())
    }

    /// Runs until cancelled or a fatal error.
    ///
    /// Connection errors from the log are retried in place. Any other error
    /// stops the pipeline without committing past unsettled records.
    pub async fn run(mut self, cancel: CancellationToken) -> errors::Result<PipelineMetrics> {
        self.start()?;
        info!(
            partition = self.partition,
            group = %self.group,
            offset = self.reader.position(),
            "pipeline started"
        );

        loop {
            match self.run_once(&cancel).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => break,
                Err(PipelineError::Source(SourceError::Connection { source })) => {
                    warn!(partition = self.partition, group = %self.group, error = %source, "log read failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                Err(e) => {
                    error!(
                        partition = self.partition,
                        group = %self.group,
                        fatal = e.is_fatal(),
                        error = %e,
                        "pipeline halted"
                    );
                    return Err(e);
                }
            }
        }

        self.shutdown()?;
        Ok(self.metrics)
    }
}
