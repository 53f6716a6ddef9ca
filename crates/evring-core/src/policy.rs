//! Accept and load-balance policy enums
//!
//! Both are plain values handed between the transport layer and the
//! runtime: `AcceptDecision` is returned by a new-connection handler to steer
//! an accept burst, `LoadBalanceStrategy` selects how workers in a ring hand
//! the accept token around.

use core::fmt;
use core::str::FromStr;

/// What an accept burst should do after handing one connection over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Keep accepting, up to the per-call maximum.
    AcceptNext,
    /// Stop once the per-call minimum has been reached.
    SuggestStop,
    /// Stop right now.
    Stop,
}

impl AcceptDecision {
    /// Whether a burst that has accepted `accepted` connections so far
    /// should end, given the per-call minimum.
    #[inline]
    pub fn ends_burst(&self, accepted: usize, min_per_call: usize) -> bool {
        match self {
            AcceptDecision::AcceptNext => false,
            AcceptDecision::SuggestStop => accepted >= min_per_call,
            AcceptDecision::Stop => true,
        }
    }
}

/// How the accept token moves between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalanceStrategy {
    /// Token is a shared lock; idle workers retry at a fixed delay.
    Lock,
    /// Token is relayed to the next ring neighbour after every accept burst.
    RoundRobin,
    /// Token goes to the first neighbour with a strictly smaller load metric.
    MetricSmaller,
    /// Token goes to the first neighbour with a strictly larger load metric.
    MetricLarger,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::Lock => "lock",
            LoadBalanceStrategy::RoundRobin => "round-robin",
            LoadBalanceStrategy::MetricSmaller => "smaller",
            LoadBalanceStrategy::MetricLarger => "larger",
        }
    }

    /// Ring strategies relay the token explicitly; the lock strategy does not.
    #[inline]
    pub fn is_ring(&self) -> bool {
        !matches!(self, LoadBalanceStrategy::Lock)
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised strategy name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStrategyError(pub String);

impl fmt::Display for ParseStrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown load balance strategy {:?} (expected lock, round-robin, smaller, larger)",
            self.0
        )
    }
}

impl std::error::Error for ParseStrategyError {}

impl FromStr for LoadBalanceStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lock" => Ok(LoadBalanceStrategy::Lock),
            "round-robin" | "roundrobin" | "rr" => Ok(LoadBalanceStrategy::RoundRobin),
            "smaller" | "metric-smaller" => Ok(LoadBalanceStrategy::MetricSmaller),
            "larger" | "metric-larger" => Ok(LoadBalanceStrategy::MetricLarger),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}
