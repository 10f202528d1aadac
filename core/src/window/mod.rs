//! Window specifications, grouping keys and the results windows emit.

pub mod accumulator;
pub mod aggregator;
pub mod assign;
pub mod sliding;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventKind, EventTime, Field};

pub use accumulator::Accumulator;
pub use aggregator::WindowAggregator;

/// Value used for a grouping field the event does not carry.
pub const MISSING_DIMENSION: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowKind {
    Tumbling { size_ms: u64 },
    Sliding { size_ms: u64 },
    Hopping { size_ms: u64, hop_ms: u64 },
}

impl WindowKind {
    pub fn size_ms(&self) -> u64 {
        match self {
            WindowKind::Tumbling { size_ms }
            | WindowKind::Sliding { size_ms }
            | WindowKind::Hopping { size_ms, .. } => *size_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    DistinctCount { field: Field },
    Sum { field: Field },
    Avg { field: Field },
    Min { field: Field },
    Max { field: Field },
    /// Value of `field` on the latest event by event time.
    Last { field: Field },
}

/// One named output of a query.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Aggregation {
    pub name: String,
    #[serde(flatten)]
    pub function: AggregateFunction,
    /// Event kinds this output counts. Empty means every kind.
    #[serde(default)]
    pub kinds: Vec<EventKind>,
}

impl Aggregation {
    pub fn admits(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Static configuration of one windowed aggregation. Never mutated after load.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WindowSpec {
    pub id: String,
    pub group_by: Vec<Field>,
    pub window: WindowKind,
    pub aggregations: Vec<Aggregation>,
    pub sink: String,
    /// Extra event time the frontier must pass beyond the window end before emission.
    #[serde(default)]
    pub trigger_delay_ms: u64,
}

/// Values of a query's grouping fields for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(BTreeMap<Field, String>);

impl GroupKey {
    pub fn of(event: &Event, fields: &[Field]) -> Self {
        Self(
            fields
                .iter()
                .map(|field| {
                    let value = event
                        .dimension(*field)
                        .unwrap_or_else(|| MISSING_DIMENSION.to_string());
                    (*field, value)
                })
                .collect(),
        )
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Field, S)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(f, v)| (f, v.into())).collect())
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", field.as_str(), value)?;
        }
        Ok(())
    }
}

/// Output of one window evaluation.
///
/// `(key, spec_id, window_end)` identifies a result; recomputing a window over
/// the same input yields an equal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub spec_id: String,
    pub key: GroupKey,
    pub window_start: EventTime,
    pub window_end: EventTime,
    /// Partition whose pipeline computed this partial result.
    pub partition: u32,
    pub event_count: u64,
    pub fields: BTreeMap<String, Value>,
}

impl AggregateResult {
    /// Idempotency key for document-store upserts.
    ///
    /// Grouping keys are not aligned with partitions, so every partition writes
    /// its own partial and the merge stage combines them.
    pub fn document_id(&self) -> String {
        format!(
            "{}|{}|{}|p{}",
            self.spec_id, self.key, self.window_end, self.partition
        )
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        if name == "event_count" {
            return Some(self.event_count as f64);
        }
        self.fields.get(name).and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_parses_flattened_function() {
        let yaml = "{ name: avg_watch, function: avg, field: duration_seconds, kinds: [video_stop] }";
        let aggregation: Aggregation = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            aggregation.function,
            AggregateFunction::Avg {
                field: Field::DurationSeconds
            }
        );
        assert!(aggregation.admits(EventKind::VideoStop));
        assert!(!aggregation.admits(EventKind::VideoStart));

        let count: Aggregation = serde_yaml::from_str("{ name: n, function: count }").unwrap();
        assert!(count.admits(EventKind::BufferEvent));
    }

    #[test]
    fn test_document_id_includes_partition() {
        let result = AggregateResult {
            spec_id: "viewer-counts".to_string(),
            key: GroupKey::from_pairs([(Field::ContentId, "42")]),
            window_start: 0,
            window_end: 10_000,
            partition: 2,
            event_count: 4,
            fields: BTreeMap::new(),
        };
        assert_eq!(result.document_id(), "viewer-counts|content_id=42|10000|p2");
        assert_eq!(result.number("event_count"), Some(4.0));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["key"]["content_id"], "42");
        let back: AggregateResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
