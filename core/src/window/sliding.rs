//! Continuously moving windows, one per grouping key.
//!
//! A key's window at change point `cp` covers event times in `(cp - size, cp]`.
//! Change points are the times at which an event enters (`t`) or ages out
//! (`t + size`). Each change point below the release frontier produces one
//! result; events sharing a timestamp are coalesced into one change point.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

use tracing::trace;

use crate::event::{Event, EventTime};
use crate::window::aggregator::OffsetRefs;
use crate::window::{Accumulator, AggregateResult, GroupKey, WindowSpec};

#[derive(Debug, Default)]
struct KeyBuffer {
    events: BTreeMap<(EventTime, u64), Event>,
    last_change: Option<EventTime>,
}

impl KeyBuffer {
    fn next_change(&self, size: i64) -> Option<EventTime> {
        let (entering, expiring) = match self.last_change {
            None => (self.events.keys().next(), self.events.keys().next()),
            Some(last) => (
                self.events.range((Excluded((last, u64::MAX)), Unbounded)).next().map(|(k, _)| k),
                self.events
                    .range((Excluded((last.saturating_sub(size), u64::MAX)), Unbounded))
                    .next()
                    .map(|(k, _)| k),
            ),
        };
        match (entering.map(|k| k.0), expiring.map(|k| k.0.saturating_add(size))) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Default)]
pub struct SlidingWindows {
    keys: BTreeMap<GroupKey, KeyBuffer>,
}

impl SlidingWindows {
    pub fn insert(&mut self, key: GroupKey, time: EventTime, offset: u64, event: Event) {
        self.keys
            .entry(key)
            .or_default()
            .events
            .insert((time, offset), event);
    }

    /// Number of keys with buffered events.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Evaluates every change point below `frontier`.
    ///
    /// Change points below `suppress_before` were emitted before a restart and
    /// are evaluated without producing results.
    pub(crate) fn evaluate(
        &mut self,
        spec: &WindowSpec,
        partition: u32,
        frontier: EventTime,
        suppress_before: Option<EventTime>,
        offsets: &mut OffsetRefs,
        out: &mut Vec<AggregateResult>,
    ) {
        let size = spec.window.size_ms() as i64;
        self.keys.retain(|key, buffer| {
            while let Some(change) = buffer.next_change(size) {
                if change >= frontier {
                    break;
                }

                let mut acc = Accumulator::new(&spec.aggregations);
                for ((time, offset), event) in buffer
                    .events
                    .range((Excluded((change.saturating_sub(size), u64::MAX)), Included((change, u64::MAX))))
                {
                    acc.add(&spec.aggregations, *time, *offset, event);
                }

                if suppress_before.is_some_and(|f| change < f) {
                    trace!(spec = %spec.id, %key, change, "suppressing replayed sliding result");
                } else {
                    out.push(AggregateResult {
                        spec_id: spec.id.clone(),
                        key: key.clone(),
                        window_start: change.saturating_sub(size),
                        window_end: change,
                        partition,
                        event_count: acc.event_count(),
                        fields: acc.fields(&spec.aggregations),
                    });
                }

                while let Some(entry) = buffer.events.first_entry() {
                    if entry.key().0.saturating_add(size) > change {
                        break;
                    }
                    let ((_, offset), _) = entry.remove_entry();
                    offsets.release(offset);
                }
                buffer.last_change = Some(change);
            }
            !buffer.events.is_empty()
        });
    }
}
