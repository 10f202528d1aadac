use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use analytics_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use analytics_core::config::AnalyticsConfig;
use analytics_core::dead_letter::{DeadLetterHandler, DeadLetterReason, DeadLetterRecord};
use analytics_core::errors::{PipelineError, SinkError};
use analytics_core::event::EventTime;
use analytics_core::sink::{
    DocumentStore, MemoryDocumentStore, MemoryObjectStore, ObjectStore, PROCESSING_VERSION, SinkRegistry,
};
use analytics_core::source::{MemoryLogReader, PartitionedLog};
use analytics_core::{Pipeline, PipelineServices};

const CONFIG: &str = r#"
version: 1
source:
  type: memory
  partition_count: 4
  retention_days: 1
processing:
  out_of_order_tolerance_ms: 1000
  late_arrival_tolerance_ms: 5000
  max_poll_records: 3
  checkpoint_interval_ms: 0
sinks:
  - { id: viewer-counts, type: document_store, container: viewer-counts }
  - { id: viewer-trend, type: document_store, container: viewer-trend }
  - { id: trending, type: document_store, container: trending }
  - { id: raw-archive, type: archive, topic: netflix-events }
  - { id: processed-events, type: document_store, container: processed-events }
queries:
  - id: viewer-counts
    group_by: [content_id]
    window: { kind: tumbling, size_ms: 10000 }
    aggregations:
      - { name: active_viewers, function: distinct_count, field: user_id, kinds: [video_start] }
      - { name: total_events, function: count }
    sink: viewer-counts
  - id: viewer-trend
    group_by: [content_id]
    window: { kind: hopping, size_ms: 10000, hop_ms: 5000 }
    aggregations:
      - { name: active_viewers, function: distinct_count, field: user_id }
    sink: viewer-trend
  - id: trending
    group_by: [content_id]
    window: { kind: sliding, size_ms: 300000 }
    aggregations:
      - { name: active_viewers, function: distinct_count, field: user_id }
    sink: trending
consumer_groups:
  - { name: cg-aggregation, queries: [viewer-counts, viewer-trend] }
  - { name: cg-trending, queries: [trending] }
  - { name: cg-archive, archive_sink: raw-archive }
  - { name: cg-events, events_sink: processed-events }
"#;

struct Engine {
    config: AnalyticsConfig,
    log: Arc<PartitionedLog>,
    dlq: Arc<PartitionedLog>,
    documents: Arc<MemoryDocumentStore>,
    objects: Arc<MemoryObjectStore>,
    checkpoints: Arc<MemoryCheckpointStore>,
}

impl Engine {
    fn new(yaml: &str) -> Self {
        let config = AnalyticsConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        Self {
            log: Arc::new(PartitionedLog::new("netflix-events", 4, 86_400_000)),
            dlq: Arc::new(PartitionedLog::new("netflix-events-dlq", 1, 86_400_000)),
            documents: Arc::new(MemoryDocumentStore::new()),
            objects: Arc::new(MemoryObjectStore::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            config,
        }
    }

    fn services(&self, documents: Arc<dyn DocumentStore>) -> PipelineServices {
        PipelineServices {
            sinks: SinkRegistry::build(&self.config.sinks, documents, self.objects.clone()),
            dead_letter: DeadLetterHandler::new(self.dlq.clone(), Duration::from_secs(1)),
            checkpoints: self.checkpoints.clone(),
        }
    }

    fn pipeline(&self, partition: u32, group: &str) -> Pipeline<MemoryLogReader> {
        self.pipeline_writing_to(partition, group, self.documents.clone())
    }

    fn pipeline_writing_to(
        &self,
        partition: u32,
        group: &str,
        documents: Arc<dyn DocumentStore>,
    ) -> Pipeline<MemoryLogReader> {
        let group = self
            .config
            .consumer_groups
            .iter()
            .find(|g| g.name == group)
            .unwrap();
        let reader = self.log.reader(partition, group.name.clone()).unwrap();
        let mut pipeline = Pipeline::from_config(&self.config, group, reader, &self.services(documents)).unwrap();
        pipeline.start().unwrap();
        pipeline
    }

    fn append(&self, partition: u32, content: &str, user: &str, time: i64) {
        let payload = json!({
            "event_type": "video_start",
            "user_id": user,
            "content_id": content,
            "content_title": format!("Title {content}"),
            "device_type": "smart_tv",
            "timestamp": time,
        });
        self.log.append(partition, payload.to_string(), time).unwrap();
    }

    fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dlq
            .snapshot(0)
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice(&r.payload).unwrap())
            .collect()
    }
}

/// A document store whose writes always fail.
struct Unavailable;

impl DocumentStore for Unavailable {
    fn upsert<'a>(
        &'a self,
        _container: &'a str,
        _id: &'a str,
        _document: Value,
        _expires_at: Option<EventTime>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Err(anyhow::anyhow!("503 service unavailable")) })
    }

    fn get<'a>(&'a self, _container: &'a str, _id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Value>>> {
        Box::pin(async { Ok(None) })
    }

    fn query<'a>(
        &'a self,
        _container: &'a str,
        _field: &'a str,
        _value: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<Vec<Value>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn purge_expired(&self, _now: EventTime) -> BoxFuture<'_, anyhow::Result<usize>> {
        Box::pin(async { Ok(0) })
    }
}

/// `(window_end, active_viewers)` of every result for title 42 in a container.
fn viewers_of_42(engine: &Engine, container: &str) -> Vec<(i64, u64)> {
    engine
        .documents
        .documents(container)
        .iter()
        .filter(|(_, d)| d["key"]["content_id"] == "42")
        .map(|(_, d)| (d["window_end"].as_i64().unwrap(), d["fields"]["active_viewers"].as_u64().unwrap()))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Runs cycles until the pipeline has read up to `end`.
async fn drain(pipeline: &mut Pipeline<MemoryLogReader>, end: u64) {
    let cancel = CancellationToken::new();
    while pipeline.position() < end {
        pipeline.run_once(&cancel).await.unwrap();
    }
}

/// Slightly disordered traffic for three titles, then one record far ahead
/// that pushes the frontier past everything before it.
fn traffic(engine: &Engine, partition: u32) -> u64 {
    for i in 0..30i64 {
        let time = 5_000 + i * 1_000 - (i % 2) * 1_500;
        let content = ["42", "7", "9"][(i % 3) as usize];
        engine.append(partition, content, &format!("u{}", i % 7), time);
    }
    engine.append(partition, "99", "u-flush", 200_000);
    engine.log.end_offset(partition).unwrap()
}

#[tokio::test]
async fn test_tumbling_scenario_end_to_end() {
    let engine = Engine::new(CONFIG);
    for (user, time) in [("u1", 1_000), ("u2", 3_000), ("u3", 3_000), ("u1", 9_000)] {
        engine.append(1, "42", user, time);
    }
    engine.append(1, "99", "u9", 20_000);

    let mut pipeline = engine.pipeline(1, "cg-aggregation");
    drain(&mut pipeline, 5).await;

    let results = engine
        .documents
        .query("viewer-counts", "window_end", &json!(10_000))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result["id"], "viewer-counts|content_id=42|10000|p1");
    assert_eq!(result["key"]["content_id"], "42");
    assert_eq!(result["fields"]["active_viewers"], 3);
    assert_eq!(result["fields"]["total_events"], 4);
    assert_eq!(result["window_end_time"], "1970-01-01T00:00:10.000Z");
}

#[tokio::test]
async fn test_sliding_scenario_reorders_record_within_tolerance() {
    let yaml = CONFIG.replace("out_of_order_tolerance_ms: 1000", "out_of_order_tolerance_ms: 10000")
        .replace("late_arrival_tolerance_ms: 5000", "late_arrival_tolerance_ms: 60000");
    let engine = Engine::new(&yaml);
    engine.append(0, "42", "u1", 90_000);
    engine.append(0, "42", "u2", 102_000);
    // 12 s behind the highest event time seen.
    engine.append(0, "42", "u3", 90_000);
    engine.append(0, "99", "u-flush", 1_000_000);

    let mut pipeline = engine.pipeline(0, "cg-trending");
    drain(&mut pipeline, 4).await;

    assert_eq!(pipeline.reconciler_stats().reordered, 1);
    assert_eq!(pipeline.reconciler_stats().adjusted, 0);
    let summary: Vec<(i64, u64)> = engine
        .documents
        .query("trending", "spec_id", &json!("trending"))
        .await
        .unwrap()
        .iter()
        .map(|d| (d["window_end"].as_i64().unwrap(), d["fields"]["active_viewers"].as_u64().unwrap()))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(
        summary,
        vec![(90_000, 2), (102_000, 3), (390_000, 1), (402_000, 0)]
    );
}

#[tokio::test]
async fn test_malformed_record_on_partition_two() {
    let engine = Engine::new(CONFIG);
    engine.append(2, "42", "u1", 1_000);
    engine.log.append(2, "{\"event_type\": \"video_start\", \"user_id\":", 1_500).unwrap();
    engine.append(2, "42", "u2", 30_000);

    let mut pipeline = engine.pipeline(2, "cg-aggregation");
    drain(&mut pipeline, 3).await;

    let letters = engine.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].error_reason, DeadLetterReason::ParseError);
    assert_eq!(letters[0].source_partition, 2);
    assert_eq!(letters[0].source_offset, 1);
    assert_eq!(letters[0].group, "cg-aggregation");

    // Only the record still in the reorder buffer holds the checkpoint back.
    let checkpoint = engine.checkpoints.load(2, "cg-aggregation").unwrap().unwrap();
    assert_eq!(checkpoint.offset, 2);
}

#[tokio::test]
async fn test_invalid_record_is_dead_lettered_as_validation_failure() {
    let engine = Engine::new(CONFIG);
    let payload = json!({ "event_type": "video_explode", "user_id": "u1", "content_id": 42, "timestamp": 1_000 });
    engine.log.append(3, payload.to_string(), 1_000).unwrap();

    let mut pipeline = engine.pipeline(3, "cg-aggregation");
    drain(&mut pipeline, 1).await;

    let letters = engine.dead_letters();
    assert_eq!(letters[0].error_reason, DeadLetterReason::ValidationFailed);
    assert!(letters[0].detail.as_deref().unwrap().contains("video_explode"));
    assert_eq!(engine.checkpoints.load(3, "cg-aggregation").unwrap().unwrap().offset, 1);
}

#[tokio::test]
async fn test_restart_from_checkpoint_reproduces_the_same_results() {
    let reference = Engine::new(CONFIG);
    let end = traffic(&reference, 0);
    let mut pipeline = reference.pipeline(0, "cg-aggregation");
    drain(&mut pipeline, end).await;
    let expected_counts = reference.documents.documents("viewer-counts");
    let expected_trend = reference.documents.documents("viewer-trend");
    assert!(!expected_counts.is_empty());
    assert!(!expected_trend.is_empty());

    for killed_after in [3, 9, 18, 27] {
        let engine = Engine::new(CONFIG);
        traffic(&engine, 0);

        // Dropped without shutdown, as if the process were killed.
        let mut first = engine.pipeline(0, "cg-aggregation");
        drain(&mut first, killed_after).await;
        drop(first);

        let mut second = engine.pipeline(0, "cg-aggregation");
        assert!(second.position() <= killed_after);
        drain(&mut second, end).await;

        assert_eq!(engine.documents.documents("viewer-counts"), expected_counts, "killed after {killed_after}");
        assert_eq!(engine.documents.documents("viewer-trend"), expected_trend, "killed after {killed_after}");
    }
}

#[tokio::test]
async fn test_consumer_groups_progress_independently() {
    let engine = Engine::new(CONFIG);
    let end = traffic(&engine, 0);

    let mut archive = engine.pipeline(0, "cg-archive");
    drain(&mut archive, end).await;
    archive.shutdown().unwrap();

    let mut aggregation = engine.pipeline(0, "cg-aggregation");
    drain(&mut aggregation, 6).await;

    assert_eq!(engine.checkpoints.load(0, "cg-archive").unwrap().unwrap().offset, end);
    assert!(engine.checkpoints.load(0, "cg-aggregation").unwrap().unwrap().offset < end);
    assert!(engine.checkpoints.load(0, "cg-trending").unwrap().is_none());

    // The archive group never parses, so nothing it read was dead-lettered.
    assert!(engine.dead_letters().is_empty());
    let paths = engine.objects.paths();
    assert_eq!(paths, vec!["netflix-events/1970-01-01/00/partition-0.ndjson".to_string()]);
    let archived = engine.objects.read(&paths[0]).await.unwrap().unwrap();
    let lines: Vec<Value> = archived
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect();
    assert_eq!(lines.len() as u64, end);
    assert_eq!(lines[3]["_offset"], 3);
}

#[tokio::test]
async fn test_sliding_restart_from_checkpoint_reproduces_the_same_results() {
    let reference = Engine::new(CONFIG);
    let end = traffic(&reference, 0);
    let mut pipeline = reference.pipeline(0, "cg-trending");
    drain(&mut pipeline, end).await;
    let expected = reference.documents.documents("trending");
    assert!(!expected.is_empty());

    for killed_after in [4, 13, 22] {
        let engine = Engine::new(CONFIG);
        traffic(&engine, 0);

        let mut first = engine.pipeline(0, "cg-trending");
        drain(&mut first, killed_after).await;
        drop(first);

        let mut second = engine.pipeline(0, "cg-trending");
        assert!(second.position() <= killed_after);
        drain(&mut second, end).await;

        assert_eq!(engine.documents.documents("trending"), expected, "killed after {killed_after}");
    }
}

#[tokio::test]
async fn test_extreme_timestamps_are_rejected_without_stalling_the_partition() {
    let engine = Engine::new(CONFIG);
    engine.append(1, "42", "u1", 1_000);
    for timestamp in [i64::MAX, i64::MIN] {
        let payload = json!({
            "event_type": "video_start",
            "user_id": "u-bad",
            "content_id": "42",
            "timestamp": timestamp,
        });
        engine.log.append(1, payload.to_string(), 2_000).unwrap();
    }
    engine.append(1, "42", "u2", 3_000);
    engine.append(1, "99", "u9", 20_000);

    let mut pipeline = engine.pipeline(1, "cg-aggregation");
    drain(&mut pipeline, 5).await;

    let letters = engine.dead_letters();
    assert_eq!(letters.len(), 2);
    assert!(letters.iter().all(|l| l.error_reason == DeadLetterReason::ValidationFailed));
    assert_eq!(letters.iter().map(|l| l.source_offset).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(pipeline.reconciler_stats().exceeded, 0);
    assert_eq!(pipeline.metrics().malformed_records, 2);

    // Records after the rejected ones still land in their windows.
    assert_eq!(viewers_of_42(&engine, "viewer-counts"), vec![(10_000, 2)]);
}

#[tokio::test]
async fn test_stop_policy_halts_without_committing_past_the_failed_write() {
    let yaml = CONFIG
        .replace("  checkpoint_interval_ms: 0\n", "  checkpoint_interval_ms: 0\n  output_error_policy: stop\n")
        .replace("sinks:\n", "retry: { max_attempts: 2, base_delay_ms: 1 }\nsinks:\n");
    let engine = Engine::new(&yaml);
    for (user, time) in [("u1", 1_000), ("u2", 3_000), ("u3", 5_000)] {
        engine.append(1, "42", user, time);
    }
    engine.append(1, "99", "u9", 20_000);

    let cancel = CancellationToken::new();
    let mut failing = engine.pipeline_writing_to(1, "cg-aggregation", Arc::new(Unavailable));
    assert_eq!(failing.run_once(&cancel).await.unwrap(), 3);
    let err = failing.run_once(&cancel).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, PipelineError::Sink(SinkError::RetriesExhausted { attempts: 2, .. })));
    drop(failing);

    // The first window still holds offset 0, so nothing it covers is committed.
    let checkpoint = engine.checkpoints.load(1, "cg-aggregation").unwrap().unwrap();
    assert_eq!(checkpoint.offset, 0);
    assert!(engine.dead_letters().is_empty());

    // Once the store is back, the restarted pipeline writes what was lost.
    let mut healthy = engine.pipeline(1, "cg-aggregation");
    assert_eq!(healthy.position(), 0);
    drain(&mut healthy, 4).await;
    assert_eq!(viewers_of_42(&engine, "viewer-counts"), vec![(10_000, 3)]);
}

fn overflow_config(policy: &str) -> String {
    CONFIG
        .replace("out_of_order_tolerance_ms: 1000", "out_of_order_tolerance_ms: 10000")
        .replace("late_arrival_tolerance_ms: 5000", "late_arrival_tolerance_ms: 60000")
        .replace(
            "  max_poll_records: 3\n",
            &format!("  max_poll_records: 3\n  reorder_buffer_capacity: 2\n  out_of_order_policy: {policy}\n"),
        )
}

/// A burst that overflows a two-record reorder buffer twice.
fn burst(engine: &Engine) {
    engine.append(0, "42", "u1", 50_000);
    engine.append(0, "42", "u2", 70_000);
    engine.append(0, "42", "u3", 65_000);
    engine.append(0, "99", "u-flush", 200_000);
}

#[tokio::test]
async fn test_buffer_overflow_admits_oldest_at_the_watermark() {
    let engine = Engine::new(&overflow_config("adjust"));
    burst(&engine);

    let mut pipeline = engine.pipeline(0, "cg-aggregation");
    drain(&mut pipeline, 4).await;

    let stats = pipeline.reconciler_stats();
    assert_eq!(stats.overflowed, 2);
    assert_eq!(stats.adjusted, 2);
    // u1 moved from 50 s up to the 60 s watermark; u3 is still open at 190 s.
    assert_eq!(viewers_of_42(&engine, "viewer-counts"), vec![(70_000, 1), (80_000, 1)]);
    assert!(engine.dead_letters().is_empty());
    assert_eq!(engine.checkpoints.load(0, "cg-aggregation").unwrap().unwrap().offset, 2);
}

#[tokio::test]
async fn test_buffer_overflow_drops_oldest_under_drop_policy() {
    let engine = Engine::new(&overflow_config("drop"));
    burst(&engine);

    let mut pipeline = engine.pipeline(0, "cg-aggregation");
    drain(&mut pipeline, 4).await;

    let stats = pipeline.reconciler_stats();
    assert_eq!(stats.overflowed, 2);
    assert_eq!(stats.late_dropped, 2);
    assert_eq!(viewers_of_42(&engine, "viewer-counts"), vec![(80_000, 1)]);
    assert_eq!(engine.checkpoints.load(0, "cg-aggregation").unwrap().unwrap().offset, 3);
}

#[tokio::test]
async fn test_valid_events_are_stored_with_processing_metadata() {
    let engine = Engine::new(CONFIG);
    engine.append(2, "42", "u1", 1_736_951_400_000);
    engine.log.append(2, "not json", 1_736_951_400_000).unwrap();
    let payload = json!({
        "event_id": "evt-9",
        "event_type": "video_stop",
        "user_id": "u2",
        "content_id": "7",
        "timestamp": "2025-01-15T15:05:00Z",
        "duration_seconds": 1320.5,
    });
    engine.log.append(2, payload.to_string(), 1_736_951_400_000).unwrap();

    let mut pipeline = engine.pipeline(2, "cg-events");
    drain(&mut pipeline, 3).await;
    pipeline.shutdown().unwrap();

    let stored = engine.documents.documents("processed-events");
    let ids: Vec<&str> = stored.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["2-0", "evt-9"]);
    let first = &stored[0].1;
    assert_eq!(first["hour_bucket"], "2025-01-15T14:00:00Z");
    assert_eq!(first["processing_version"], PROCESSING_VERSION);
    assert_eq!(first["content_title"], "Title 42");
    assert_eq!(stored[1].1["duration_seconds"], 1320.5);

    assert_eq!(pipeline.metrics().events_written, 2);
    assert_eq!(engine.dead_letters()[0].error_reason, DeadLetterReason::ParseError);
    assert_eq!(engine.checkpoints.load(2, "cg-events").unwrap().unwrap().offset, 3);
}
