//! Percent, speed and ETA estimation over a sliding window of samples.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of `(timestamp, units_done)` samples kept for speed estimation.
pub const WINDOW_LEN: usize = 16;

/// A computed progress snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressReport {
    pub units_done: u64,
    pub total_units: u64,
    /// 0.0..=100.0; exactly 100.0 only once every unit is done.
    pub percent: f64,
    /// Units per second over the sample window.
    pub units_per_sec: f64,
    /// Span (bytes) per second over the sample window.
    pub span_per_sec: f64,
    pub elapsed: Duration,
    /// `None` while the window shows no forward movement.
    pub remaining: Option<Duration>,
}

/// What a transfer hands to its progress callback after each chunk.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub units_done: u64,
    pub total_units: u64,
    /// Block cursor position, out of the device's total blocks.
    pub position: u64,
    /// `None` while no rate can be computed yet.
    pub report: Option<ProgressReport>,
}

#[derive(Debug)]
pub struct ProgressTracker {
    start: Instant,
    total_units: u64,
    total_span: u64,
    window: VecDeque<(Instant, u64)>,
}

impl ProgressTracker {
    /// `total_units` is what `units_done` counts up to; `total_span` is the
    /// same amount expressed in bytes.
    pub fn init(start: Instant, total_units: u64, total_span: u64) -> Self {
        Self {
            start,
            total_units,
            total_span,
            window: VecDeque::with_capacity(WINDOW_LEN),
        }
    }

    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    pub fn update(&mut self, units_done: u64) -> Option<ProgressReport> {
        self.update_at(Instant::now(), units_done)
    }

    /// Records a sample taken at `now` and computes a report from the window.
    pub fn update_at(&mut self, now: Instant, units_done: u64) -> Option<ProgressReport> {
        if self.window.len() == WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back((now, units_done));

        let &(first_at, first_units) = self.window.front()?;
        if self.window.len() < 2 {
            return None;
        }
        let span = now.saturating_duration_since(first_at);
        if span.is_zero() {
            return None;
        }

        let secs = span.as_secs_f64();
        let units_per_sec = units_done.saturating_sub(first_units) as f64 / secs;
        let bytes_per_unit = if self.total_units == 0 {
            0.0
        } else {
            self.total_span as f64 / self.total_units as f64
        };

        let percent = if units_done >= self.total_units {
            100.0
        } else {
            (units_done as f64 * 100.0 / self.total_units as f64).min(99.99)
        };
        let left = self.total_units.saturating_sub(units_done);
        let remaining = if left == 0 {
            Some(Duration::ZERO)
        } else if units_per_sec > 0.0 {
            Some(Duration::from_secs_f64(left as f64 / units_per_sec))
        } else {
            None
        };

        Some(ProgressReport {
            units_done,
            total_units: self.total_units,
            percent,
            units_per_sec,
            span_per_sec: units_per_sec * bytes_per_unit,
            elapsed: now.saturating_duration_since(self.start),
            remaining,
        })
    }
}
