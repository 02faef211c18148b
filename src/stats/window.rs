//! Fixed-capacity rolling window and cumulative accumulator

use std::collections::VecDeque;

/// Point-in-time aggregate of a series of values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,

    /// Population standard deviation, `None` below two samples
    pub std_dev: Option<f64>,
}

/// Most recent `capacity` values of one parameter, oldest first
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    /// Create an empty window
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, returning the evicted oldest value when full
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = if self.values.len() == self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        self.values.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values, oldest first
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Summarize the window contents
    ///
    /// Two passes over at most `capacity` values: the mean first, then the
    /// squared deviations from it.
    pub fn summary(&self) -> Option<Summary> {
        let n = self.values.len();
        if n == 0 {
            return None;
        }

        let mean = self.iter().sum::<f64>() / n as f64;
        let (min, max) = self
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let std_dev = (n >= 2).then(|| {
            let sq: f64 = self.iter().map(|v| (v - mean) * (v - mean)).sum();
            (sq / n as f64).sqrt()
        });

        Some(Summary {
            count: n as u64,
            mean,
            min,
            max,
            std_dev,
        })
    }
}

/// Since-start aggregate using Welford's online algorithm
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn summary(&self) -> Option<Summary> {
        if self.count == 0 {
            return None;
        }

        let std_dev = (self.count >= 2).then(|| (self.m2 / self.count as f64).max(0.0).sqrt());

        Some(Summary {
            count: self.count,
            mean: self.mean,
            min: self.min,
            max: self.max,
            std_dev,
        })
    }
}
