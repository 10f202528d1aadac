//! Event-time window assignment for tumbling and hopping windows.
//!
//! Windows are half-open `[start, end)` and aligned to the epoch. Ingested
//! event times are never before the epoch, so no window of either kind starts
//! below zero in practice.

use crate::event::EventTime;
use crate::window::WindowKind;

/// Start of the tumbling window of `size_ms` that contains `time`.
pub fn tumbling_start(time: EventTime, size_ms: u64) -> EventTime {
    let size = size_ms as i64;
    time - time.rem_euclid(size)
}

/// Starts of every hopping window containing `time`, latest first.
///
/// Starts are multiples of `hop_ms`; no window starts before the epoch, so
/// events in the first `size_ms` fall into fewer than `ceil(size/hop)` windows.
pub fn hopping_starts(time: EventTime, size_ms: u64, hop_ms: u64) -> Vec<EventTime> {
    let size = size_ms as i64;
    let hop = hop_ms as i64;
    let mut starts = Vec::new();
    let mut start = time - time.rem_euclid(hop);
    while start > time.saturating_sub(size) && start >= 0 {
        starts.push(start);
        start -= hop;
    }
    starts
}

/// `(start, end)` of every fixed window `time` belongs to. Sliding windows
/// have no fixed boundaries and get none.
pub fn assign(kind: &WindowKind, time: EventTime) -> Vec<(EventTime, EventTime)> {
    match *kind {
        WindowKind::Tumbling { size_ms } => {
            let start = tumbling_start(time, size_ms);
            vec![(start, start.saturating_add(size_ms as i64))]
        }
        WindowKind::Hopping { size_ms, hop_ms } => hopping_starts(time, size_ms, hop_ms)
            .into_iter()
            .map(|start| (start, start.saturating_add(size_ms as i64)))
            .collect(),
        WindowKind::Sliding { .. } => Vec::new(),
    }
}
