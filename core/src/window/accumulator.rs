use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::event::{Event, EventTime, Field};
use crate::window::{AggregateFunction, Aggregation};

/// Partial state of one named aggregation.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Count(u64),
    Distinct(BTreeSet<String>),
    Sum(f64),
    Avg { sum: f64, samples: u64 },
    Min(Option<f64>),
    Max(Option<f64>),
    Last(Option<(EventTime, u64, Value)>),
}

impl Slot {
    fn new(function: &AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Slot::Count(0),
            AggregateFunction::DistinctCount { .. } => Slot::Distinct(BTreeSet::new()),
            AggregateFunction::Sum { .. } => Slot::Sum(0.0),
            AggregateFunction::Avg { .. } => Slot::Avg { sum: 0.0, samples: 0 },
            AggregateFunction::Min { .. } => Slot::Min(None),
            AggregateFunction::Max { .. } => Slot::Max(None),
            AggregateFunction::Last { .. } => Slot::Last(None),
        }
    }
}

/// Incremental aggregate over the events of one window.
///
/// Slots line up with the query's `aggregations`. Events are folded in
/// `(event time, offset)` order, so the same input gives the same output.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    event_count: u64,
    slots: Vec<Slot>,
}

fn field_value(event: &Event, field: Field) -> Option<Value> {
    match event.measure(field) {
        Some(number) => Some(Value::from(number)),
        None => event.dimension(field).map(Value::String),
    }
}

impl Accumulator {
    pub fn new(aggregations: &[Aggregation]) -> Self {
        Self {
            event_count: 0,
            slots: aggregations.iter().map(|a| Slot::new(&a.function)).collect(),
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn add(&mut self, aggregations: &[Aggregation], time: EventTime, offset: u64, event: &Event) {
        self.event_count += 1;
        for (aggregation, slot) in aggregations.iter().zip(self.slots.iter_mut()) {
            if !aggregation.admits(event.kind) {
                continue;
            }
            match (&aggregation.function, slot) {
                (AggregateFunction::Count, Slot::Count(n)) => *n += 1,
                (AggregateFunction::DistinctCount { field }, Slot::Distinct(seen)) => {
                    if let Some(value) = event.dimension(*field) {
                        seen.insert(value);
                    }
                }
                (AggregateFunction::Sum { field }, Slot::Sum(sum)) => {
                    *sum += event.measure(*field).unwrap_or(0.0);
                }
                (AggregateFunction::Avg { field }, Slot::Avg { sum, samples }) => {
                    if let Some(value) = event.measure(*field) {
                        *sum += value;
                        *samples += 1;
                    }
                }
                (AggregateFunction::Min { field }, Slot::Min(min)) => {
                    if let Some(value) = event.measure(*field) {
                        *min = Some(min.map_or(value, |m| m.min(value)));
                    }
                }
                (AggregateFunction::Max { field }, Slot::Max(max)) => {
                    if let Some(value) = event.measure(*field) {
                        *max = Some(max.map_or(value, |m| m.max(value)));
                    }
                }
                (AggregateFunction::Last { field }, Slot::Last(last)) => {
                    let newer = last
                        .as_ref()
                        .is_none_or(|(t, o, _)| (time, offset) >= (*t, *o));
                    if newer {
                        if let Some(value) = field_value(event, *field) {
                            *last = Some((time, offset, value));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Named output values. `avg` outputs also report `{name}_samples` so
    /// partial averages can be merged by weight.
    pub fn fields(&self, aggregations: &[Aggregation]) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        for (aggregation, slot) in aggregations.iter().zip(&self.slots) {
            let name = aggregation.name.clone();
            let value = match slot {
                Slot::Count(n) => Value::from(*n),
                Slot::Distinct(seen) => Value::from(seen.len() as u64),
                Slot::Sum(sum) => Value::from(*sum),
                Slot::Avg { sum, samples } => {
                    fields.insert(format!("{name}_samples"), Value::from(*samples));
                    if *samples == 0 {
                        Value::Null
                    } else {
                        Value::from(sum / *samples as f64)
                    }
                }
                Slot::Min(v) | Slot::Max(v) => v.map(Value::from).unwrap_or(Value::Null),
                Slot::Last(last) => last
                    .as_ref()
                    .map(|(_, _, v)| v.clone())
                    .unwrap_or(Value::Null),
            };
            fields.insert(name, value);
        }
        fields
    }
}
