//! Wall-clock progress cadence and throughput math.

use std::time::{Duration, Instant};

use crate::state::Snapshot;

/// Floor applied to the average speed in the ETA division, so a
/// near-stalled scan reports a huge-but-finite estimate instead of
/// diverging.
const ETA_SPEED_FLOOR: f64 = 1.0;

/// One emitted progress report. Plain data derived from a
/// [`Snapshot`] plus the reporter's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    pub completed: usize,
    pub total: usize,
    pub available: usize,
    /// Addresses per minute since the previous tick.
    pub recent_per_min: f64,
    /// Addresses per minute over the whole scan.
    pub average_per_min: f64,
    /// `None` until at least one probe has completed.
    pub eta_minutes: Option<f64>,
}

impl ProgressTick {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }

    pub fn unreachable(&self) -> usize {
        self.completed - self.available
    }
}

/// Emits throughput and ETA reports on a fixed wall-clock cadence,
/// plus a forced final report. Reads snapshots only; never touches
/// scan state, so a reporting bug cannot corrupt results.
#[derive(Debug)]
pub struct ProgressReporter {
    interval: Duration,
    last_report: Instant,
    last_completed: usize,
}

impl ProgressReporter {
    pub fn new(interval: Duration) -> Self {
        Self::started_at(interval, Instant::now())
    }

    /// Explicit start instant, for tests that steer the clock. The
    /// first tick's "recent" window opens here.
    pub fn started_at(interval: Duration, started: Instant) -> Self {
        ProgressReporter { interval, last_report: started, last_completed: 0 }
    }

    /// Cadence check. Emits a tick once `interval` has elapsed since
    /// the previous one, advancing the bookkeeping; otherwise `None`.
    pub fn observe(&mut self, snap: &Snapshot, now: Instant) -> Option<ProgressTick> {
        if now.duration_since(self.last_report) < self.interval {
            return None;
        }
        Some(self.emit(snap, now))
    }

    /// Unconditional tick for scan end, off-cadence.
    pub fn finalize(&mut self, snap: &Snapshot, now: Instant) -> ProgressTick {
        self.emit(snap, now)
    }

    fn emit(&mut self, snap: &Snapshot, now: Instant) -> ProgressTick {
        let recent_min = now.duration_since(self.last_report).as_secs_f64() / 60.0;
        let recent = snap.completed.saturating_sub(self.last_completed);
        let recent_per_min = if recent_min > 0.0 { recent as f64 / recent_min } else { 0.0 };

        let overall_min = snap.elapsed.as_secs_f64() / 60.0;
        let average_per_min = if overall_min > 0.0 { snap.completed as f64 / overall_min } else { 0.0 };

        let eta_minutes = if average_per_min > 0.0 {
            let remaining = snap.total.saturating_sub(snap.completed) as f64;
            Some(remaining / average_per_min.max(ETA_SPEED_FLOOR))
        } else {
            None
        };

        self.last_report = now;
        self.last_completed = snap.completed;

        ProgressTick {
            completed: snap.completed,
            total: snap.total,
            available: snap.available,
            recent_per_min,
            average_per_min,
            eta_minutes,
        }
    }
}
