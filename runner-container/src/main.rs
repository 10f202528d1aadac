use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use analytics_core::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use analytics_core::config::{AnalyticsConfig, ConsumerGroupConfig, SourceType, load_config};
use analytics_core::dead_letter::{DeadLetterHandler, DeadLetterLog};
use analytics_core::merge::MergeStage;
use analytics_core::sink::{DocumentStore, MemoryDocumentStore, MemoryObjectStore, SinkRegistry};
use analytics_core::source::{LogReader, PartitionedLog};
use analytics_core::telemetry::{PipelineMetrics, init_tracing};
use analytics_core::{Pipeline, PipelineServices};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

type PipelineOutcome = (u32, String, analytics_core::Result<PipelineMetrics>);

/// Entry point for running the aggregation engine as a long-lived container.
///
/// What it does at a high-level:
///     Load and validate config.
///     Start one pipeline per (partition, consumer group), the merge stages
///     and a maintenance task for retention and document expiry.
///     Run until Ctrl-C, or until every pipeline has stopped.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;
    config.validate()?;

    let cancel = CancellationToken::new();
    let documents = Arc::new(MemoryDocumentStore::new());
    let document_store: Arc<dyn DocumentStore> = documents.clone();
    let sinks = SinkRegistry::build(&config.sinks, document_store, Arc::new(MemoryObjectStore::new()));
    let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint.directory {
        Some(directory) => Arc::new(FileCheckpointStore::new(directory)?),
        None => Arc::new(MemoryCheckpointStore::new()),
    };

    let mut logs = Vec::new();
    let dead_letter_log: Arc<dyn DeadLetterLog> = match config.source.source_type {
        #[cfg(feature = "kafka")]
        SourceType::Kafka if config.dead_letter.topic.is_some() => {
            let kafka = config.source.kafka.as_ref().context("source.kafka is required")?;
            let topic = config.dead_letter.topic.as_deref().unwrap_or_default();
            Arc::new(analytics_core::source::kafka::KafkaDeadLetterLog::new(kafka, topic)?)
        }
        _ => {
            let log = Arc::new(PartitionedLog::new(
                "dead-letters",
                config.dead_letter.partition_count,
                config.dead_letter.retention_days as u64 * 24 * 60 * 60 * 1000,
            ));
            logs.push(Arc::clone(&log));
            log
        }
    };
    let services = PipelineServices {
        sinks: sinks.clone(),
        dead_letter: DeadLetterHandler::new(
            dead_letter_log,
            Duration::from_millis(config.dead_letter.timeout_ms),
        ),
        checkpoints,
    };

    let mut pipelines: JoinSet<PipelineOutcome> = JoinSet::new();
    match config.source.source_type {
        SourceType::Memory | SourceType::File => {
            let ingress = Arc::new(PartitionedLog::new(
                "ingress",
                config.source.partition_count,
                config.source.retention_ms(),
            ));
            if let Some(path) = &config.source.path {
                ingress.replay_ndjson(path).await?;
            }
            for group in &config.consumer_groups {
                for partition in 0..config.source.partition_count {
                    let reader = ingress.reader(partition, group.name.clone())?;
                    spawn_pipeline(&mut pipelines, &config, group, reader, &services, &cancel)?;
                }
            }
            logs.push(ingress);
        }
        #[cfg(feature = "kafka")]
        SourceType::Kafka => {
            use analytics_core::source::kafka::{KafkaLogReader, health_check};
            let kafka = config.source.kafka.as_ref().context("source.kafka is required")?;
            let partitions = health_check(kafka)?;
            if partitions != config.source.partition_count {
                warn!(configured = config.source.partition_count, actual = partitions, "partition count differs from the topic");
            }
            for group in &config.consumer_groups {
                for partition in 0..partitions {
                    let reader = KafkaLogReader::new(kafka, &group.name, partition)?;
                    spawn_pipeline(&mut pipelines, &config, group, reader, &services, &cancel)?;
                }
            }
        }
        #[cfg(not(feature = "kafka"))]
        SourceType::Kafka => anyhow::bail!("built without the `kafka` feature"),
    }

    let mut background = JoinSet::new();
    for merge in &config.merges {
        let stage = MergeStage::from_config(&config, merge, &sinks)?;
        background.spawn(stage.run(cancel.clone()));
    }
    background.spawn(maintain(logs, documents, cancel.clone()));

    info!(pipelines = pipelines.len(), merges = config.merges.len(), "analytics engine running");

    let mut failures = 0;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            joined = pipelines.join_next() => match joined {
                None => break,
                Some(outcome) => failures += report(outcome),
            },
        }
    }

    cancel.cancel();
    while let Some(outcome) = pipelines.join_next().await {
        failures += report(outcome);
    }
    while background.join_next().await.is_some() {}

    if failures > 0 {
        anyhow::bail!("{failures} pipeline(s) stopped on a fatal error");
    }
    info!("analytics engine stopped");
    Ok(())
}

fn spawn_pipeline<R: LogReader + 'static>(
    tasks: &mut JoinSet<PipelineOutcome>,
    config: &AnalyticsConfig,
    group: &ConsumerGroupConfig,
    reader: R,
    services: &PipelineServices,
    cancel: &CancellationToken,
) -> Result<()> {
    let partition = reader.partition();
    let name = group.name.clone();
    let pipeline = Pipeline::from_config(config, group, reader, services)?;
    let cancel = cancel.clone();
    tasks.spawn(async move { (partition, name, pipeline.run(cancel).await) });
    Ok(())
}

fn report(outcome: Result<PipelineOutcome, tokio::task::JoinError>) -> usize {
    match outcome {
        Ok((partition, group, Ok(metrics))) => {
            info!(partition, %group, ?metrics, "pipeline finished");
            0
        }
        Ok((partition, group, Err(e))) => {
            error!(
                partition,
                %group,
                fatal = e.is_fatal(),
                retryable = e.is_retryable(),
                error = %e,
                "pipeline failed"
            );
            1
        }
        Err(e) => {
            error!(error = %e, "pipeline task panicked");
            1
        }
    }
}

/// Applies log retention and document expiry once a minute.
async fn maintain(logs: Vec<Arc<PartitionedLog>>, documents: Arc<MemoryDocumentStore>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp_millis();
                for log in &logs {
                    log.enforce_retention(now);
                }
                match documents.purge_expired(now).await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "expired documents removed"),
                    Err(e) => warn!(error = %e, "document expiry failed"),
                }
            }
        }
    }
}
