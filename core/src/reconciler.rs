//! Out-of-order and late-arrival handling for one partition.
//!
//! The watermark `W` is the highest event time seen minus the out-of-order
//! tolerance. Records are buffered and released in `(event time, offset)` order
//! once they fall below the release frontier `W - T_ooo`; a record older than
//! the frontier on arrival is late, and one older than `W - T_late` is dropped
//! whatever the policy.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::{LatePolicy, ProcessingConfig};
use crate::event::{Event, EventTime};

/// A record that passed reconciliation, with its effective event time.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub offset: u64,
    pub time: EventTime,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    OnTime,
    /// Late within tolerance; admitted with its time moved forward.
    Adjusted { from: EventTime, to: EventTime },
    /// Late within tolerance, discarded under [`LatePolicy::Drop`].
    Dropped,
    /// Behind the late-arrival tolerance.
    Exceeded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStats {
    pub on_time: u64,
    pub reordered: u64,
    pub adjusted: u64,
    pub late_dropped: u64,
    pub exceeded: u64,
    pub overflowed: u64,
}

pub struct Reconciler {
    out_of_order_ms: i64,
    late_arrival_ms: i64,
    policy: LatePolicy,
    capacity: usize,
    max_seen: Option<EventTime>,
    buffer: BTreeMap<(EventTime, u64), Event>,
    forced: Vec<Admitted>,
    offsets: BTreeSet<u64>,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            out_of_order_ms: config.out_of_order_tolerance_ms as i64,
            late_arrival_ms: config.late_arrival_tolerance_ms as i64,
            policy: config.out_of_order_policy,
            capacity: config.reorder_buffer_capacity.max(1),
            max_seen: None,
            buffer: BTreeMap::new(),
            forced: Vec::new(),
            offsets: BTreeSet::new(),
            stats: ReconcilerStats::default(),
        }
    }

    /// `None` until the first record is seen. Never decreases.
    pub fn watermark(&self) -> Option<EventTime> {
        self.max_seen.map(|max| max.saturating_sub(self.out_of_order_ms))
    }

    /// Event time below which every admitted record has been released.
    pub fn frontier(&self) -> Option<EventTime> {
        Some(self.watermark()?.saturating_sub(self.out_of_order_ms))
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.forced.len()
    }

    /// Lowest offset held in the reorder buffer.
    pub fn lowest_offset(&self) -> Option<u64> {
        self.offsets.first().copied()
    }

    /// Classifies one record and buffers it if admitted.
    pub fn offer(&mut self, offset: u64, event: Event) -> Verdict {
        let time = event.event_time;
        let verdict = match (self.watermark(), self.frontier()) {
            (Some(watermark), Some(frontier)) if time < frontier => {
                if time < watermark.saturating_sub(self.late_arrival_ms) {
                    self.stats.exceeded += 1;
                    debug!(offset, time, watermark, "record behind late-arrival tolerance");
                    return Verdict::Exceeded;
                }
                match self.policy {
                    LatePolicy::Drop => {
                        self.stats.late_dropped += 1;
                        trace!(offset, time, watermark, "late record dropped");
                        return Verdict::Dropped;
                    }
                    LatePolicy::Adjust => {
                        let to = watermark.max(frontier);
                        self.stats.adjusted += 1;
                        trace!(offset, from = time, to, "late record adjusted");
                        self.insert(offset, to, event);
                        Verdict::Adjusted { from: time, to }
                    }
                }
            }
            _ => {
                self.stats.on_time += 1;
                if self.max_seen.is_some_and(|max| time < max) {
                    self.stats.reordered += 1;
                }
                self.max_seen = Some(self.max_seen.map_or(time, |max| max.max(time)));
                self.insert(offset, time, event);
                Verdict::OnTime
            }
        };
        self.enforce_capacity();
        verdict
    }

    fn insert(&mut self, offset: u64, time: EventTime, event: Event) {
        self.buffer.insert((time, offset), event);
        self.offsets.insert(offset);
    }

    /// Force-flushes the oldest buffered records as late while over capacity.
    ///
    /// Under [`LatePolicy::Adjust`] a flushed record is released at once with
    /// its time raised to the watermark if it is behind it, like any other
    /// late record. The frontier stays where it is.
    fn enforce_capacity(&mut self) {
        while self.buffer.len() > self.capacity {
            let Some(((time, offset), event)) = self.buffer.pop_first() else {
                break;
            };
            self.stats.overflowed += 1;
            match (self.policy, self.watermark()) {
                (LatePolicy::Adjust, Some(watermark)) => {
                    let to = time.max(watermark);
                    self.stats.adjusted += 1;
                    self.forced.push(Admitted { offset, time: to, event });
                    debug!(offset, from = time, to, capacity = self.capacity, "reorder buffer overflow");
                }
                _ => {
                    self.stats.late_dropped += 1;
                    self.offsets.remove(&offset);
                    debug!(offset, time, capacity = self.capacity, "reorder buffer overflow dropped record");
                }
            }
        }
    }

    /// Drains every record below the frontier in `(event time, offset)` order.
    pub fn release(&mut self) -> Vec<Admitted> {
        let mut released = std::mem::take(&mut self.forced);
        if let Some(frontier) = self.frontier() {
            while let Some(entry) = self.buffer.first_entry() {
                if entry.key().0 >= frontier {
                    break;
                }
                let ((time, offset), event) = entry.remove_entry();
                released.push(Admitted { offset, time, event });
            }
        }
        for admitted in &released {
            self.offsets.remove(&admitted.offset);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: LatePolicy, capacity: usize) -> ProcessingConfig {
        ProcessingConfig {
            out_of_order_tolerance_ms: 10_000,
            late_arrival_tolerance_ms: 60_000,
            out_of_order_policy: policy,
            reorder_buffer_capacity: capacity,
            ..ProcessingConfig::default()
        }
    }

    fn event(time: EventTime) -> Event {
        let payload = serde_json::json!({
            "event_type": "video_start",
            "user_id": "u1",
            "content_id": "42",
            "timestamp": time,
        });
        Event::parse(payload.to_string().as_bytes(), time).unwrap()
    }

    fn times(released: &[Admitted]) -> Vec<EventTime> {
        released.iter().map(|a| a.time).collect()
    }

    #[test]
    fn test_first_record_is_always_accepted() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Drop, 10));
        assert_eq!(reconciler.watermark(), None);
        assert_eq!(reconciler.offer(0, event(5_000_000)), Verdict::OnTime);
        assert_eq!(reconciler.watermark(), Some(4_990_000));
    }

    #[test]
    fn test_release_waits_for_frontier() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Adjust, 100));
        reconciler.offer(0, event(0));
        reconciler.offer(1, event(5_000));
        reconciler.offer(2, event(25_000));

        assert_eq!(reconciler.watermark(), Some(15_000));
        assert_eq!(reconciler.frontier(), Some(5_000));
        assert_eq!(times(&reconciler.release()), vec![0]);
        assert_eq!(reconciler.lowest_offset(), Some(1));
        assert_eq!(reconciler.buffered(), 2);
    }

    #[test]
    fn test_out_of_order_record_is_resorted() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Adjust, 100));
        reconciler.offer(0, event(100_000));
        reconciler.offer(1, event(110_000));
        // Twelve seconds behind the newest record.
        assert_eq!(reconciler.offer(2, event(98_000)), Verdict::OnTime);
        reconciler.offer(3, event(130_000));

        let released = reconciler.release();
        assert_eq!(times(&released), vec![98_000, 100_000]);
        assert_eq!(released[0].offset, 2);
        assert_eq!(reconciler.stats().reordered, 1);
    }

    #[test]
    fn test_late_drop_boundary() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Adjust, 100));
        reconciler.offer(0, event(200_000));
        let watermark = reconciler.watermark().unwrap();
        assert_eq!(watermark, 190_000);

        let bound = watermark - 60_000;
        assert_eq!(reconciler.offer(1, event(bound - 1)), Verdict::Exceeded);
        assert_eq!(
            reconciler.offer(2, event(bound + 1)),
            Verdict::Adjusted {
                from: bound + 1,
                to: watermark
            }
        );
        assert_eq!(reconciler.stats().exceeded, 1);
        assert_eq!(reconciler.stats().adjusted, 1);
        assert_eq!(reconciler.lowest_offset(), Some(0));
    }

    #[test]
    fn test_drop_policy_discards_late_records() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Drop, 100));
        reconciler.offer(0, event(200_000));
        assert_eq!(reconciler.offer(1, event(175_000)), Verdict::Dropped);
        assert_eq!(reconciler.stats().late_dropped, 1);
        assert_eq!(reconciler.buffered(), 1);
    }

    #[test]
    fn test_watermark_never_decreases() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Adjust, 100));
        reconciler.offer(0, event(50_000));
        reconciler.offer(1, event(45_000));
        reconciler.offer(2, event(10_000));
        assert_eq!(reconciler.watermark(), Some(40_000));
    }

    #[test]
    fn test_overflow_force_flushes_oldest_at_the_watermark_under_adjust() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Adjust, 2));
        reconciler.offer(0, event(100_000));
        reconciler.offer(1, event(120_000));
        reconciler.offer(2, event(115_000));

        let stats = reconciler.stats();
        assert_eq!(stats.overflowed, 1);
        assert_eq!(stats.adjusted, 1);
        // The frontier is untouched by the flush.
        assert_eq!(reconciler.frontier(), Some(100_000));

        let released = reconciler.release();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].offset, 0);
        assert_eq!(released[0].time, 110_000);
        assert_eq!(released[0].event.event_time, 100_000);
        assert_eq!(reconciler.lowest_offset(), Some(1));

        // Records between the frontier and the watermark are still on time.
        assert_eq!(reconciler.offer(3, event(105_000)), Verdict::OnTime);
    }

    #[test]
    fn test_overflow_keeps_the_time_of_a_record_ahead_of_the_watermark() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Adjust, 2));
        reconciler.offer(0, event(100_000));
        reconciler.offer(1, event(101_000));
        reconciler.offer(2, event(102_000));

        assert_eq!(reconciler.watermark(), Some(92_000));
        let released = reconciler.release();
        assert_eq!((released[0].offset, released[0].time), (0, 100_000));
        assert_eq!(reconciler.frontier(), Some(82_000));
    }

    #[test]
    fn test_overflow_discards_oldest_under_drop() {
        let mut reconciler = Reconciler::new(&config(LatePolicy::Drop, 1));
        reconciler.offer(0, event(1_000));
        reconciler.offer(1, event(2_000));

        assert_eq!(reconciler.stats().overflowed, 1);
        assert_eq!(reconciler.stats().late_dropped, 1);
        assert!(reconciler.release().is_empty());
        assert_eq!(reconciler.lowest_offset(), Some(1));
    }

    #[test]
    fn test_extreme_times_saturate() {
        let mut config = config(LatePolicy::Adjust, 10);
        config.out_of_order_tolerance_ms = u64::MAX / 2;
        let mut reconciler = Reconciler::new(&config);
        assert_eq!(reconciler.offer(0, event(1_000)), Verdict::OnTime);
        assert_eq!(reconciler.watermark(), Some(1_000 - i64::MAX));
        assert_eq!(reconciler.frontier(), Some(i64::MIN));
        assert!(reconciler.release().is_empty());
    }
}
