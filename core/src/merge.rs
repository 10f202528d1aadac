//! Periodic cross-partition merge of emitted partial results.
//!
//! Grouping keys do not line up with partitions, so every partition writes its
//! own partial result per window. A merge stage reads them back from the
//! document store, combines partials per (window, key) and writes a ranked
//! top-N document per window.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AnalyticsConfig, MergeConfig};
use crate::errors::ConfigError;
use crate::event::{EventTime, format_time};
use crate::sink::{DocumentStore, SinkHandle, SinkRegistry};
use crate::window::{AggregateFunction, AggregateResult, Aggregation, GroupKey};

/// One key's result combined over every partition that saw it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedResult {
    pub key: GroupKey,
    pub window_start: EventTime,
    pub window_end: EventTime,
    pub partitions: Vec<u32>,
    pub event_count: u64,
    pub fields: BTreeMap<String, Value>,
}

impl MergedResult {
    pub fn number(&self, name: &str) -> Option<f64> {
        if name == "event_count" {
            return Some(self.event_count as f64);
        }
        self.fields.get(name).and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub rank: usize,
    #[serde(flatten)]
    pub result: MergedResult,
}

fn sum_counts(partials: &[&AggregateResult], name: &str) -> Value {
    let total: u64 = partials
        .iter()
        .filter_map(|p| p.fields.get(name).and_then(Value::as_u64))
        .sum();
    Value::from(total)
}

fn extremum(partials: &[&AggregateResult], name: &str, pick: fn(f64, f64) -> f64) -> Value {
    partials
        .iter()
        .filter_map(|p| p.number(name))
        .reduce(pick)
        .map(Value::from)
        .unwrap_or(Value::Null)
}

/// Combines partials of one (window, key).
///
/// Counts and sums add up. A distinct count adds up too, which over-counts a
/// value seen on more than one partition. Averages are weighted by their
/// sample counts. `last` takes the value from the highest partition that has
/// one.
pub fn combine(aggregations: &[Aggregation], partials: &[&AggregateResult]) -> Option<MergedResult> {
    let first = partials.first()?;
    let mut fields = BTreeMap::new();
    for aggregation in aggregations {
        let name = aggregation.name.as_str();
        let value = match aggregation.function {
            AggregateFunction::Count | AggregateFunction::DistinctCount { .. } => {
                sum_counts(partials, name)
            }
            AggregateFunction::Sum { .. } => {
                Value::from(partials.iter().filter_map(|p| p.number(name)).sum::<f64>())
            }
            AggregateFunction::Min { .. } => extremum(partials, name, f64::min),
            AggregateFunction::Max { .. } => extremum(partials, name, f64::max),
            AggregateFunction::Avg { .. } => {
                let samples_field = format!("{name}_samples");
                let (weighted, samples) = partials
                    .iter()
                    .filter_map(|p| {
                        let samples = p.fields.get(&samples_field).and_then(Value::as_u64)?;
                        Some((p.number(name)? * samples as f64, samples))
                    })
                    .fold((0.0, 0u64), |(w, n), (pw, pn)| (w + pw, n + pn));
                fields.insert(samples_field, Value::from(samples));
                if samples == 0 {
                    Value::Null
                } else {
                    Value::from(weighted / samples as f64)
                }
            }
            AggregateFunction::Last { .. } => partials
                .iter()
                .filter_map(|p| p.fields.get(name).filter(|v| !v.is_null()).map(|v| (p.partition, v)))
                .max_by_key(|(partition, _)| *partition)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null),
        };
        fields.insert(aggregation.name.clone(), value);
    }

    let mut partitions: Vec<u32> = partials.iter().map(|p| p.partition).collect();
    partitions.sort_unstable();
    partitions.dedup();
    Some(MergedResult {
        key: first.key.clone(),
        window_start: first.window_start,
        window_end: first.window_end,
        partitions,
        event_count: partials.iter().map(|p| p.event_count).sum(),
        fields,
    })
}

/// Orders by `rank_by` descending, then key ascending, and keeps `top_n`.
/// Keys without a numeric `rank_by` rank last.
pub fn rank(mut merged: Vec<MergedResult>, rank_by: &str, top_n: usize) -> Vec<RankedEntry> {
    merged.sort_by(|a, b| {
        let (x, y) = (a.number(rank_by), b.number(rank_by));
        match (x, y) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| a.key.cmp(&b.key))
    });
    merged
        .into_iter()
        .take(top_n)
        .enumerate()
        .map(|(i, result)| RankedEntry { rank: i + 1, result })
        .collect()
}

pub struct MergeStage {
    config: MergeConfig,
    aggregations: Vec<Aggregation>,
    source: Arc<dyn DocumentStore>,
    source_container: String,
    target: Arc<dyn DocumentStore>,
    target_container: String,
    ttl_ms: Option<i64>,
    /// Last document written per window end, to skip unchanged rewrites.
    written: HashMap<EventTime, Value>,
}

fn document_sink(sinks: &SinkRegistry, id: &str) -> Result<(Arc<dyn DocumentStore>, String, Option<i64>), ConfigError> {
    match sinks.get(id) {
        Ok(SinkHandle::Document {
            store,
            container,
            ttl_ms,
        }) => Ok((Arc::clone(store), container.clone(), *ttl_ms)),
        _ => Err(ConfigError::Invalid {
            message: format!("sink '{id}' is not a document store"),
        }),
    }
}

impl MergeStage {
    pub fn from_config(
        config: &AnalyticsConfig,
        merge: &MergeConfig,
        sinks: &SinkRegistry,
    ) -> Result<Self, ConfigError> {
        let query = config.query(&merge.query).ok_or_else(|| ConfigError::Invalid {
            message: format!("merge '{}' reads unknown query '{}'", merge.id, merge.query),
        })?;
        let (source, source_container, _) = document_sink(sinks, &query.sink)?;
        let (target, target_container, ttl_ms) = document_sink(sinks, &merge.sink)?;
        Ok(Self {
            config: merge.clone(),
            aggregations: query.aggregations.clone(),
            source,
            source_container,
            target,
            target_container,
            ttl_ms,
            written: HashMap::new(),
        })
    }

    /// Merges every partial currently stored for the query. Returns how many
    /// window documents were (re)written.
    pub async fn run_once(&mut self) -> anyhow::Result<usize> {
        let spec_id = Value::String(self.config.query.clone());
        let documents = self
            .source
            .query(&self.source_container, "spec_id", &spec_id)
            .await?;

        let mut partials = Vec::with_capacity(documents.len());
        for document in documents {
            match serde_json::from_value::<AggregateResult>(document) {
                Ok(result) => partials.push(result),
                Err(e) => warn!(merge = %self.config.id, error = %e, "skipping unreadable partial"),
            }
        }

        let mut by_window: BTreeMap<EventTime, BTreeMap<&GroupKey, Vec<&AggregateResult>>> =
            BTreeMap::new();
        for partial in &partials {
            by_window
                .entry(partial.window_end)
                .or_default()
                .entry(&partial.key)
                .or_default()
                .push(partial);
        }

        let mut rewritten = 0;
        for (window_end, keys) in &by_window {
            let merged: Vec<MergedResult> = keys
                .values()
                .filter_map(|group| combine(&self.aggregations, group))
                .collect();
            let window_start = merged.first().map_or(*window_end, |m| m.window_start);
            let entries = rank(merged, &self.config.rank_by, self.config.top_n);

            let id = format!("{}|{}", self.config.id, window_end);
            let document = serde_json::json!({
                "id": id,
                "merge_id": self.config.id,
                "spec_id": self.config.query,
                "rank_by": self.config.rank_by,
                "window_start": window_start,
                "window_end": window_end,
                "window_start_time": format_time(window_start),
                "window_end_time": format_time(*window_end),
                "entries": entries,
            });
            if self.written.get(window_end) == Some(&document) {
                continue;
            }
            let expires_at = self.ttl_ms.map(|ttl| window_end + ttl);
            self.target
                .upsert(&self.target_container, &id, document.clone(), expires_at)
                .await?;
            self.written.insert(*window_end, document);
            rewritten += 1;
        }
        self.written.retain(|window_end, _| by_window.contains_key(window_end));

        if rewritten > 0 {
            debug!(merge = %self.config.id, partials = partials.len(), rewritten, "merged partial results");
        }
        Ok(rewritten)
    }

    /// Merges every `interval_ms` until cancelled. Failed rounds are logged
    /// and retried on the next tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(merge = %self.config.id, query = %self.config.query, "merge stage started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(merge = %self.config.id, error = %e, "merge round failed");
                    }
                }
            }
        }
        info!(merge = %self.config.id, "merge stage stopped");
    }
}
