//! Scan-pass accumulation and final aggregation.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::{Cause, Outcome, Verdict, VerificationRecord};

/// Per-cause tallies for unreachable verdicts. Diagnostic only; the
/// scan's observable behavior never branches on these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CauseTally {
    pub timeout: u64,
    pub connection_refused: u64,
    pub status_mismatch: u64,
    pub location_mismatch: u64,
    pub other: u64,
}

impl CauseTally {
    fn bump(&mut self, cause: Cause) {
        match cause {
            Cause::Timeout => self.timeout += 1,
            Cause::ConnectionRefused => self.connection_refused += 1,
            Cause::StatusMismatch(_) => self.status_mismatch += 1,
            Cause::LocationMismatch => self.location_mismatch += 1,
            Cause::Other => self.other += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.timeout + self.connection_refused + self.status_mismatch + self.location_mismatch + self.other
    }
}

/// Mutable accumulator for one scan pass.
///
/// Exactly one owner, the sweep's consume loop, writes verdicts in
/// completion order; everyone else sees point-in-time [`Snapshot`]s.
#[derive(Debug)]
pub struct ScanState {
    total: usize,
    completed: usize,
    available: Vec<Ipv4Addr>,
    causes: CauseTally,
    started: Instant,
}

impl ScanState {
    pub fn new(total: usize) -> Self {
        Self::started_at(total, Instant::now())
    }

    /// Explicit start instant, for tests that steer the clock.
    pub fn started_at(total: usize, started: Instant) -> Self {
        ScanState {
            total,
            completed: 0,
            available: Vec::new(),
            causes: CauseTally::default(),
            started,
        }
    }

    /// Folds one verdict. Outcome first, count second, so a snapshot
    /// taken after this call always sees the two together.
    pub fn record(&mut self, verdict: &Verdict) {
        debug_assert!(self.completed < self.total);
        match verdict.outcome {
            Outcome::Available => self.available.push(verdict.addr),
            Outcome::Unreachable(cause) => self.causes.bump(cause),
        }
        self.completed += 1;
    }

    pub fn snapshot(&self, now: Instant) -> Snapshot {
        Snapshot {
            completed: self.completed,
            total: self.total,
            available: self.available.len(),
            elapsed: now.duration_since(self.started),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn is_done(&self) -> bool {
        self.completed == self.total
    }

    /// Positives in completion order.
    pub fn available(&self) -> &[Ipv4Addr] {
        &self.available
    }

    pub fn into_report(self, now: Instant) -> ScanReport {
        ScanReport {
            total: self.total,
            completed: self.completed,
            available: self.available,
            causes: self.causes,
            elapsed: now.duration_since(self.started),
        }
    }
}

/// Immutable point-in-time view handed to the progress reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub completed: usize,
    pub total: usize,
    pub available: usize,
    /// Time since the scan started, on the scan's own clock.
    pub elapsed: Duration,
}

/// Final outcome of one full pass.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub total: usize,
    pub completed: usize,
    /// Positives exactly as they were folded, completion order.
    pub available: Vec<Ipv4Addr>,
    pub causes: CauseTally,
    pub elapsed: Duration,
}

impl ScanReport {
    /// Positives reordered numerically. Always a permutation of
    /// `available`; `Ipv4Addr` orders by address value, so no textual
    /// sort key is involved.
    pub fn sorted_available(&self) -> Vec<Ipv4Addr> {
        let mut out = self.available.clone();
        out.sort_unstable();
        out
    }

    pub fn unreachable(&self) -> usize {
        self.completed - self.available.len()
    }

    /// Fraction of completed probes that were positive, as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.available.len() as f64 / self.completed as f64 * 100.0
        }
    }
}

/// Sorted subset of the records the verification pass confirmed.
pub fn confirmed_sorted(records: &[VerificationRecord]) -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = records
        .iter()
        .filter(|r| r.confirmed)
        .map(|r| r.addr)
        .collect();
    out.sort_unstable();
    out
}
