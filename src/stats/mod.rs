//! # Statistics Module
//!
//! Rolling-window and cumulative statistics per sensor parameter.
//!
//! The [`StatsAggregator`] is owned by the ingestion loop. After every
//! mutation it publishes a fresh immutable [`StatsSnapshot`] through an
//! `ArcSwap`, so [`StatsHandle::snapshot`] never blocks ingestion and never
//! observes a half-applied update.

pub mod window;

use arc_swap::ArcSwap;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::sensor::protocol::{ParamCode, Reading};
use crate::sensor::validator::StrictnessMode;

pub use window::{Accumulator, RollingWindow, Summary};

/// Ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    /// Non-empty frames received
    pub frames: u64,
    pub valid: u64,
    pub invalid: u64,
    pub malformed: u64,
    pub overflows: u64,
    pub timeouts: u64,
    pub reconnects: u64,
    /// Readings that could not be written, and frames dropped with a connection
    pub lost: u64,
}

impl IngestCounters {
    /// Counter names and values, in stats-log order
    pub fn rows(&self) -> [(&'static str, u64); 8] {
        [
            ("_frames", self.frames),
            ("_valid", self.valid),
            ("_invalid", self.invalid),
            ("_malformed", self.malformed),
            ("_overflows", self.overflows),
            ("_timeouts", self.timeouts),
            ("_reconnects", self.reconnects),
            ("_lost", self.lost),
        ]
    }
}

/// Statistics of one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStats {
    pub last: f64,
    pub window: Summary,
    pub cumulative: Summary,
}

/// Immutable point-in-time view of the aggregator
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Local>,
    pub window_capacity: usize,
    /// Parameters seen so far, in table order
    pub parameters: BTreeMap<ParamCode, ParameterStats>,
    pub counters: IngestCounters,
}

impl StatsSnapshot {
    /// Snapshot with no data
    pub fn empty(window_capacity: usize) -> Self {
        Self {
            taken_at: Local::now(),
            window_capacity,
            parameters: BTreeMap::new(),
            counters: IngestCounters::default(),
        }
    }

    pub fn get(&self, code: ParamCode) -> Option<&ParameterStats> {
        self.parameters.get(&code)
    }
}

#[derive(Debug, Clone)]
struct ParameterState {
    window: RollingWindow,
    cumulative: Accumulator,
}

/// Cloneable read side of the aggregator
#[derive(Debug, Clone)]
pub struct StatsHandle {
    current: Arc<ArcSwap<StatsSnapshot>>,
}

impl StatsHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<StatsSnapshot> {
        self.current.load_full()
    }
}

/// Per-parameter rolling and cumulative statistics
#[derive(Debug)]
pub struct StatsAggregator {
    window_capacity: usize,
    strictness: StrictnessMode,
    parameters: BTreeMap<ParamCode, ParameterState>,
    counters: IngestCounters,
    published: Arc<ArcSwap<StatsSnapshot>>,
}

impl StatsAggregator {
    /// Create an aggregator
    ///
    /// # Arguments
    ///
    /// * `window_capacity` - Rolling window length per parameter
    /// * `strictness` - Whether invalid readings are aggregated
    pub fn new(window_capacity: usize, strictness: StrictnessMode) -> Self {
        let window_capacity = window_capacity.max(1);
        Self {
            window_capacity,
            strictness,
            parameters: BTreeMap::new(),
            counters: IngestCounters::default(),
            published: Arc::new(ArcSwap::from_pointee(StatsSnapshot::empty(window_capacity))),
        }
    }

    /// Read handle for concurrent consumers
    pub fn handle(&self) -> StatsHandle {
        StatsHandle {
            current: Arc::clone(&self.published),
        }
    }

    /// Record a validated reading
    ///
    /// Counts the reading as valid or invalid, then aggregates its values
    /// unless the strictness mode excludes it.
    ///
    /// # Returns
    ///
    /// * `bool` - Whether the values entered the statistics
    pub fn record(&mut self, reading: &Reading) -> bool {
        if reading.is_valid() {
            self.counters.valid += 1;
        } else {
            self.counters.invalid += 1;
        }

        let admitted = self.strictness.admits(reading);
        if admitted {
            for &(code, value) in reading.values() {
                let capacity = self.window_capacity;
                let state = self.parameters.entry(code).or_insert_with(|| ParameterState {
                    window: RollingWindow::new(capacity),
                    cumulative: Accumulator::new(),
                });
                state.window.push(value);
                state.cumulative.push(value);
            }
        }

        self.publish();
        admitted
    }

    /// Apply a counter update and publish it
    pub fn count(&mut self, update: impl FnOnce(&mut IngestCounters)) {
        update(&mut self.counters);
        self.publish();
    }

    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    /// Build a snapshot of the current state
    pub fn snapshot(&self) -> StatsSnapshot {
        let parameters = self
            .parameters
            .iter()
            .filter_map(|(code, state)| {
                Some((
                    *code,
                    ParameterStats {
                        last: state.window.last()?,
                        window: state.window.summary()?,
                        cumulative: state.cumulative.summary()?,
                    },
                ))
            })
            .collect();

        StatsSnapshot {
            taken_at: Local::now(),
            window_capacity: self.window_capacity,
            parameters,
            counters: self.counters,
        }
    }

    /// Build a snapshot and make it the one consumers see
    pub fn publish(&self) -> Arc<StatsSnapshot> {
        let snapshot = Arc::new(self.snapshot());
        self.published.store(Arc::clone(&snapshot));
        snapshot
    }
}
