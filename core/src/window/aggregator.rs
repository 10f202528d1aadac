use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::event::{Event, EventTime};
use crate::window::assign::assign;
use crate::window::sliding::SlidingWindows;
use crate::window::{Accumulator, AggregateResult, GroupKey, WindowKind, WindowSpec};

/// Reference counts of input offsets still contributing to live window state.
#[derive(Debug, Default)]
pub(crate) struct OffsetRefs(BTreeMap<u64, u32>);

impl OffsetRefs {
    pub(crate) fn hold(&mut self, offset: u64) {
        *self.0.entry(offset).or_insert(0) += 1;
    }

    pub(crate) fn release(&mut self, offset: u64) {
        if let Some(count) = self.0.get_mut(&offset) {
            *count -= 1;
            if *count == 0 {
                self.0.remove(&offset);
            }
        }
    }

    pub(crate) fn lowest(&self) -> Option<u64> {
        self.0.keys().next().copied()
    }
}

/// Lifecycle of a fixed window. Purged windows leave the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    Open,
    /// The frontier passed the window end; waiting out the trigger delay.
    Closing,
    Emitted,
}

#[derive(Debug)]
struct WindowState {
    end: EventTime,
    phase: WindowPhase,
    acc: Accumulator,
    /// Offsets folded in since the last emission.
    pending: Vec<u64>,
}

/// Arena key: grouping key, index of the query, window start.
type WindowId = (GroupKey, usize, EventTime);

/// Per-partition window state for every query a consumer group runs.
///
/// Records go in through [`add`](Self::add) in release order; results come out
/// of [`advance`](Self::advance) as the release frontier moves.
pub struct WindowAggregator {
    partition: u32,
    specs: Vec<WindowSpec>,
    /// How long an emitted window is kept for corrections.
    grace_ms: u64,
    windows: BTreeMap<WindowId, WindowState>,
    sliding: Vec<SlidingWindows>,
    offsets: OffsetRefs,
    frontier: Option<EventTime>,
    suppress_before: Option<EventTime>,
}

impl WindowAggregator {
    pub fn new(partition: u32, specs: Vec<WindowSpec>, grace_ms: u64) -> Self {
        let sliding = specs.iter().map(|_| SlidingWindows::default()).collect();
        Self {
            partition,
            specs,
            grace_ms,
            windows: BTreeMap::new(),
            sliding,
            offsets: OffsetRefs::default(),
            frontier: None,
            suppress_before: None,
        }
    }

    /// Skips emissions a previous run already made before `frontier`.
    pub fn suppress_before(&mut self, frontier: EventTime) {
        self.suppress_before = Some(frontier);
    }

    pub fn frontier(&self) -> Option<EventTime> {
        self.frontier
    }

    pub fn specs(&self) -> &[WindowSpec] {
        &self.specs
    }

    /// Lowest input offset whose effect on the output is not yet emitted.
    pub fn lowest_unsettled_offset(&self) -> Option<u64> {
        self.offsets.lowest()
    }

    /// Fixed windows in the arena plus sliding keys with buffered events.
    pub fn live_state(&self) -> usize {
        self.windows.len() + self.sliding.iter().map(SlidingWindows::key_count).sum::<usize>()
    }

    pub fn window_phase(&self, key: &GroupKey, spec_id: &str, start: EventTime) -> Option<WindowPhase> {
        let index = self.specs.iter().position(|s| s.id == spec_id)?;
        self.windows
            .get(&(key.clone(), index, start))
            .map(|state| state.phase)
    }

    /// Folds one released record into every window it belongs to.
    pub fn add(&mut self, offset: u64, time: EventTime, event: &Event) {
        for (index, spec) in self.specs.iter().enumerate() {
            let key = GroupKey::of(event, &spec.group_by);
            match spec.window {
                WindowKind::Sliding { .. } => {
                    self.offsets.hold(offset);
                    self.sliding[index].insert(key, time, offset, event.clone());
                }
                WindowKind::Tumbling { .. } | WindowKind::Hopping { .. } => {
                    let purge_after = self.grace_ms.max(spec.trigger_delay_ms) as i64;
                    for (start, end) in assign(&spec.window, time) {
                        if self.frontier.is_some_and(|f| f >= end.saturating_add(purge_after)) {
                            warn!(
                                spec = %spec.id,
                                %key,
                                offset,
                                window_end = end,
                                "record for purged window ignored"
                            );
                            continue;
                        }
                        let state = self
                            .windows
                            .entry((key.clone(), index, start))
                            .or_insert_with(|| WindowState {
                                end,
                                phase: WindowPhase::Open,
                                acc: Accumulator::new(&spec.aggregations),
                                pending: Vec::new(),
                            });
                        if state.phase != WindowPhase::Open {
                            debug!(spec = %spec.id, %key, window_end = end, "correction re-opens window");
                            state.phase = WindowPhase::Open;
                        }
                        state.acc.add(&spec.aggregations, time, offset, event);
                        state.pending.push(offset);
                        self.offsets.hold(offset);
                    }
                }
            }
        }
    }

    /// Moves the frontier and returns newly emitted results ordered by
    /// `(window end, query, key)`.
    pub fn advance(&mut self, frontier: EventTime) -> Vec<AggregateResult> {
        let frontier = self.frontier.map_or(frontier, |f| f.max(frontier));
        self.frontier = Some(frontier);

        let specs = &self.specs;
        let offsets = &mut self.offsets;
        let suppress_before = self.suppress_before;
        let partition = self.partition;
        let grace_ms = self.grace_ms;
        let mut out = Vec::new();

        self.windows.retain(|(key, index, start), state| {
            let spec = &specs[*index];
            let delay = spec.trigger_delay_ms as i64;

            if state.phase == WindowPhase::Open && frontier >= state.end {
                trace!(spec = %spec.id, %key, window_end = state.end, "window closing");
                state.phase = WindowPhase::Closing;
            }
            if state.phase == WindowPhase::Closing && frontier >= state.end.saturating_add(delay) {
                if suppress_before.is_some_and(|f| state.end.saturating_add(delay) <= f) {
                    trace!(spec = %spec.id, %key, window_end = state.end, "suppressing replayed window");
                } else {
                    out.push(AggregateResult {
                        spec_id: spec.id.clone(),
                        key: key.clone(),
                        window_start: *start,
                        window_end: state.end,
                        partition,
                        event_count: state.acc.event_count(),
                        fields: state.acc.fields(&spec.aggregations),
                    });
                }
                for offset in state.pending.drain(..) {
                    offsets.release(offset);
                }
                state.phase = WindowPhase::Emitted;
            }

            let purge_after = grace_ms.max(spec.trigger_delay_ms) as i64;
            !(state.phase == WindowPhase::Emitted && frontier >= state.end.saturating_add(purge_after))
        });

        for (spec, sliding) in specs.iter().zip(self.sliding.iter_mut()) {
            if matches!(spec.window, WindowKind::Sliding { .. }) {
                sliding.evaluate(spec, partition, frontier, suppress_before, offsets, &mut out);
            }
        }

        out.sort_by(|a, b| {
            (a.window_end, &a.spec_id, &a.key).cmp(&(b.window_end, &b.spec_id, &b.key))
        });
        if !out.is_empty() {
            debug!(partition, frontier, emitted = out.len(), "windows emitted");
        }
        out
    }
}
