use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;
use crate::window::{AggregateFunction, WindowKind, WindowSpec};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyticsConfig {
    pub version: u32,
    pub source: SourceConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub queries: Vec<WindowSpec>,
    pub consumer_groups: Vec<ConsumerGroupConfig>,
    #[serde(default)]
    pub merges: Vec<MergeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// In-process log, fed by whoever holds the handle.
    Memory,
    /// NDJSON file replayed into the in-process log at startup.
    File,
    Kafka,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub partition_count: u32,
    pub retention_days: u32,
    pub path: Option<String>,
    pub kafka: Option<KafkaOptions>,
}

impl SourceConfig {
    pub fn retention_ms(&self) -> u64 {
        self.retention_days as u64 * MS_PER_DAY
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub topic: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub poll_timeout_ms: Option<u64>,
}

/// What to do with an event that arrives behind the out-of-order tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Rewrite the event time to the current watermark and admit it.
    #[default]
    Adjust,
    Drop,
}

/// What to do once a sink write has exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputErrorPolicy {
    /// Dead-letter the result and keep going.
    #[default]
    Drop,
    /// Halt the pipeline without advancing its checkpoint.
    Stop,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub out_of_order_tolerance_ms: u64,
    pub late_arrival_tolerance_ms: u64,
    pub out_of_order_policy: LatePolicy,
    pub output_error_policy: OutputErrorPolicy,
    pub dead_letter_late_events: bool,
    pub reorder_buffer_capacity: usize,
    pub max_poll_records: usize,
    pub checkpoint_interval_ms: u64,
    pub sink_failure_ceiling: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            out_of_order_tolerance_ms: 10_000,
            late_arrival_tolerance_ms: 60_000,
            out_of_order_policy: LatePolicy::Adjust,
            output_error_policy: OutputErrorPolicy::Drop,
            dead_letter_late_events: true,
            reorder_buffer_capacity: 10_000,
            max_poll_records: 500,
            checkpoint_interval_ms: 5_000,
            sink_failure_ceiling: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub partition_count: u32,
    pub retention_days: u32,
    pub timeout_ms: u64,
    /// Kafka topic for dead letters when the source is Kafka.
    pub topic: Option<String>,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            partition_count: 1,
            retention_days: 1,
            timeout_ms: 2_000,
            topic: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for checkpoint files. Checkpoints stay in memory when unset.
    pub directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SinkConfig {
    pub id: String,
    #[serde(flatten)]
    pub target: SinkTarget,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkTarget {
    DocumentStore {
        container: String,
        ttl_seconds: Option<u64>,
    },
    Archive {
        topic: String,
        /// Root directory for archived objects. Kept in memory when unset.
        root: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerGroupConfig {
    pub name: String,
    #[serde(default)]
    pub queries: Vec<String>,
    /// Archive every raw record this group reads into the given archive sink.
    #[serde(default)]
    pub archive_sink: Option<String>,
    /// Upsert every valid event, enriched with processing metadata, into the
    /// given document store sink.
    #[serde(default)]
    pub events_sink: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeConfig {
    pub id: String,
    pub query: String,
    pub rank_by: String,
    pub top_n: usize,
    pub sink: String,
    pub interval_ms: u64,
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<AnalyticsConfig> {
    match config_path {
        Some(path) => AnalyticsConfig::from_file(path),
        None => AnalyticsConfig::from_env(),
    }
}

impl AnalyticsConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("ANALYTICS_CONFIG")
            .map_err(|_| anyhow::anyhow!("ANALYTICS_CONFIG environment variable not set"))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AnalyticsConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: String| Err(ConfigError::ValidationFailed { reason });

        if self.source.partition_count == 0 {
            return fail("partition_count must be at least 1".to_string());
        }
        match self.source.source_type {
            SourceType::File if self.source.path.is_none() => {
                return Err(ConfigError::MissingField {
                    field: "source.path".to_string(),
                });
            }
            SourceType::Kafka if self.source.kafka.is_none() => {
                return Err(ConfigError::MissingField {
                    field: "source.kafka".to_string(),
                });
            }
            _ => {}
        }

        let processing = &self.processing;
        if processing.late_arrival_tolerance_ms <= processing.out_of_order_tolerance_ms {
            return fail(format!(
                "late_arrival_tolerance_ms ({}) must exceed out_of_order_tolerance_ms ({})",
                processing.late_arrival_tolerance_ms, processing.out_of_order_tolerance_ms
            ));
        }
        if processing.reorder_buffer_capacity == 0 || processing.max_poll_records == 0 {
            return fail("reorder_buffer_capacity and max_poll_records must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".to_string());
        }
        if self.dead_letter.partition_count == 0 {
            return fail("dead_letter.partition_count must be at least 1".to_string());
        }

        let mut sink_ids = HashSet::new();
        for sink in &self.sinks {
            if !sink_ids.insert(sink.id.as_str()) {
                return fail(format!("duplicate sink id '{}'", sink.id));
            }
        }

        let mut query_ids = HashSet::new();
        for query in &self.queries {
            if !query_ids.insert(query.id.as_str()) {
                return fail(format!("duplicate query id '{}'", query.id));
            }
            validate_query(query)?;
            if self.sink(&query.sink).is_none() {
                return fail(format!("query '{}' targets unknown sink '{}'", query.id, query.sink));
            }
        }

        if self.consumer_groups.is_empty() {
            return fail("At least one consumer group must be configured".to_string());
        }
        let mut group_names = HashSet::new();
        for group in &self.consumer_groups {
            if group.name.is_empty() || !group_names.insert(group.name.as_str()) {
                return fail(format!("consumer group name '{}' is empty or duplicated", group.name));
            }
            for query in &group.queries {
                if !query_ids.contains(query.as_str()) {
                    return fail(format!("group '{}' runs unknown query '{}'", group.name, query));
                }
            }
            if let Some(archive) = &group.archive_sink {
                match self.sink(archive) {
                    Some(SinkTarget::Archive { .. }) => {}
                    _ => {
                        return fail(format!(
                            "group '{}' archive_sink '{}' is not an archive sink",
                            group.name, archive
                        ));
                    }
                }
            }
            if let Some(events) = &group.events_sink {
                if !matches!(self.sink(events), Some(SinkTarget::DocumentStore { .. })) {
                    return fail(format!(
                        "group '{}' events_sink '{}' is not a document store sink",
                        group.name, events
                    ));
                }
            }
            if group.queries.is_empty() && group.archive_sink.is_none() && group.events_sink.is_none() {
                return fail(format!("group '{}' has nothing to do", group.name));
            }
        }

        for merge in &self.merges {
            if !query_ids.contains(merge.query.as_str()) {
                return fail(format!("merge '{}' reads unknown query '{}'", merge.id, merge.query));
            }
            if !matches!(self.sink(&merge.sink), Some(SinkTarget::DocumentStore { .. })) {
                return fail(format!("merge '{}' must write to a document_store sink", merge.id));
            }
            if merge.top_n == 0 || merge.interval_ms == 0 {
                return fail(format!("merge '{}' needs positive top_n and interval_ms", merge.id));
            }
        }
        Ok(())
    }

    pub fn sink(&self, id: &str) -> Option<&SinkTarget> {
        self.sinks.iter().find(|s| s.id == id).map(|s| &s.target)
    }

    pub fn query(&self, id: &str) -> Option<&WindowSpec> {
        self.queries.iter().find(|q| q.id == id)
    }
}

fn validate_query(query: &WindowSpec) -> Result<(), ConfigError> {
    let fail = |reason: String| Err(ConfigError::ValidationFailed { reason });
    match query.window {
        WindowKind::Tumbling { size_ms } | WindowKind::Sliding { size_ms } if size_ms == 0 => {
            return fail(format!("query '{}' has a zero window size", query.id));
        }
        WindowKind::Hopping { size_ms, hop_ms } if hop_ms == 0 || hop_ms >= size_ms => {
            return fail(format!(
                "query '{}' needs 0 < hop_ms < size_ms (got hop {} size {})",
                query.id, hop_ms, size_ms
            ));
        }
        _ => {}
    }
    if query.group_by.is_empty() {
        return fail(format!("query '{}' has no group_by fields", query.id));
    }
    if query.aggregations.is_empty() {
        return fail(format!("query '{}' has no aggregations", query.id));
    }
    let mut names = HashSet::new();
    for aggregation in &query.aggregations {
        if !names.insert(aggregation.name.as_str()) {
            return fail(format!(
                "query '{}' defines '{}' twice",
                query.id, aggregation.name
            ));
        }
        match aggregation.function {
            AggregateFunction::Sum { field }
            | AggregateFunction::Avg { field }
            | AggregateFunction::Min { field }
            | AggregateFunction::Max { field }
                if !field.is_measure() =>
            {
                return fail(format!(
                    "query '{}': '{}' needs a numeric field, got {}",
                    query.id,
                    aggregation.name,
                    field.as_str()
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
source:
  type: memory
  partition_count: 4
  retention_days: 1
processing:
  out_of_order_tolerance_ms: 10000
  late_arrival_tolerance_ms: 60000
  out_of_order_policy: drop
sinks:
  - id: viewer-counts
    type: document_store
    container: viewer-counts
    ttl_seconds: 86400
  - id: raw-archive
    type: archive
    topic: netflix-events
queries:
  - id: viewer-counts
    group_by: [content_id]
    window: { kind: tumbling, size_ms: 10000 }
    aggregations:
      - { name: active_viewers, function: distinct_count, field: user_id, kinds: [video_start] }
      - { name: total_events, function: count }
      - { name: avg_watch_seconds, function: avg, field: duration_seconds, kinds: [video_stop, video_complete] }
    sink: viewer-counts
consumer_groups:
  - name: cg-aggregation
    queries: [viewer-counts]
  - name: cg-archive
    archive_sink: raw-archive
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = AnalyticsConfig::from_yaml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.source.partition_count, 4);
        assert_eq!(config.source.retention_ms(), MS_PER_DAY);
        assert_eq!(config.processing.out_of_order_policy, LatePolicy::Drop);
        assert_eq!(config.processing.output_error_policy, OutputErrorPolicy::Drop);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(
            config.sink("raw-archive"),
            Some(&SinkTarget::Archive {
                topic: "netflix-events".to_string(),
                root: None
            })
        );
        let query = config.query("viewer-counts").unwrap();
        assert_eq!(query.window, WindowKind::Tumbling { size_ms: 10_000 });
        assert_eq!(query.aggregations.len(), 3);
    }

    #[test]
    fn test_missing_file_names_its_path() {
        let err = AnalyticsConfig::from_file("/nonexistent/analytics.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/analytics.yaml"));
    }

    #[test]
    fn test_unknown_sink_is_rejected() {
        let yaml = SAMPLE.replace("    sink: viewer-counts", "    sink: nowhere");
        let config = AnalyticsConfig::from_yaml(&yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown sink 'nowhere'"));
    }

    #[test]
    fn test_hop_must_be_smaller_than_size() {
        let yaml = SAMPLE.replace(
            "{ kind: tumbling, size_ms: 10000 }",
            "{ kind: hopping, size_ms: 10000, hop_ms: 10000 }",
        );
        let config = AnalyticsConfig::from_yaml(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_late_tolerance_must_exceed_out_of_order_tolerance() {
        let yaml = SAMPLE.replace("late_arrival_tolerance_ms: 60000", "late_arrival_tolerance_ms: 5000");
        let config = AnalyticsConfig::from_yaml(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_events_sink_must_be_a_document_store() {
        let yaml = SAMPLE.replace(
            "    archive_sink: raw-archive\n",
            "    archive_sink: raw-archive\n  - name: cg-events\n    events_sink: raw-archive\n",
        );
        let config = AnalyticsConfig::from_yaml(&yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not a document store sink"));

        let config = AnalyticsConfig::from_yaml(&yaml.replace("events_sink: raw-archive", "events_sink: viewer-counts")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.consumer_groups[2].events_sink.as_deref(), Some("viewer-counts"));
    }

    #[test]
    fn test_sum_over_a_dimension_is_rejected() {
        let yaml = SAMPLE.replace(
            "{ name: total_events, function: count }",
            "{ name: total_events, function: sum, field: user_id }",
        );
        let config = AnalyticsConfig::from_yaml(&yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
