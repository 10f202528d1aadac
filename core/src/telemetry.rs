use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "analytics_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters for one (partition, consumer group) pipeline, logged at checkpoint time.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineMetrics {
    pub records_read: u64,
    pub bytes_read: u64,
    pub batches_processed: u64,
    pub malformed_records: u64,
    pub late_dead_lettered: u64,
    pub events_written: u64,
    pub events_dead_lettered: u64,
    pub results_emitted: u64,
    pub results_written: u64,
    pub results_dead_lettered: u64,
    pub raw_records_archived: u64,
    pub dead_letter_failures: u64,
    pub checkpoints_committed: u64,
}
