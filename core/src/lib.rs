//! Core types shared by the edgesweep scan engine.

use std::fmt;
use std::net::Ipv4Addr;

pub mod limiter;
pub mod progress;
pub mod state;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Why a probe fell short of the redirect signature.
///
/// Carried inside [`Outcome::Unreachable`] for per-cause tallies and
/// debug logging; callers branch only on the outcome itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// The request exceeded the overall or connect deadline.
    Timeout,
    /// TCP connect failed outright.
    ConnectionRefused,
    /// Responded, but not with status 302.
    StatusMismatch(u16),
    /// Status 302 with a missing or different `Location` value.
    LocationMismatch,
    /// Any other transport failure.
    Other,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Timeout => write!(f, "timeout"),
            Cause::ConnectionRefused => write!(f, "connection refused"),
            Cause::StatusMismatch(code) => write!(f, "status mismatch ({code})"),
            Cause::LocationMismatch => write!(f, "location mismatch"),
            Cause::Other => write!(f, "transport error"),
        }
    }
}

/// Binary outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The address answered with the exact redirect signature.
    Available,
    Unreachable(Cause),
}

impl Outcome {
    pub fn is_available(&self) -> bool {
        matches!(self, Outcome::Available)
    }
}

/// One probe's result. Every address produces exactly one per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub addr: Ipv4Addr,
    pub outcome: Outcome,
}

impl Verdict {
    pub fn available(addr: Ipv4Addr) -> Self {
        Verdict { addr, outcome: Outcome::Available }
    }

    pub fn unreachable(addr: Ipv4Addr, cause: Cause) -> Self {
        Verdict { addr, outcome: Outcome::Unreachable(cause) }
    }
}

/// Result of re-probing one previously positive address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationRecord {
    pub addr: Ipv4Addr,
    pub confirmed: bool,
}
