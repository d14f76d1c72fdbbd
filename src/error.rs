//! Error taxonomy and retry timing for pipeline operations.
//!
//! Every failure surfaced by the pipeline maps onto one of five classes:
//! - Transient: timeouts and transport faults, retried with backoff
//! - Data quality: gate failures, routed to quarantine and never retried
//! - Schema: hard mismatches that need an operator fix
//! - Constraint: referential violations during a merge
//! - Already running: the per-(group, date) concurrency guard
//!
//! Subsystems keep their own error enums; they classify themselves into
//! this taxonomy via `kind()` accessors so the orchestrator can decide
//! retry vs. quarantine vs. halt without inspecting error internals.

use std::time::Duration;

use thiserror::Error;

/// Default maximum attempts for a retryable stage.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff base: first retry waits this long.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 30_000;

/// Ceiling on any single backoff delay.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 300_000;

/// Default jitter fraction added on top of the exponential delay.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;

/// Failure classes driving the orchestrator's branch decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeout or transport fault; eligible for retry with backoff.
    Transient,
    /// Quality gate failure; routed to quarantine, never auto-retried.
    DataQuality,
    /// Hard schema or contract mismatch; fatal until an operator fixes it.
    Schema,
    /// Referential violation during a warehouse merge; fatal, alerted.
    Constraint,
    /// A run already holds the lease for this (group, process date).
    AlreadyRunning,
}

impl ErrorKind {
    /// Whether errors of this kind are eligible for the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::DataQuality => "data_quality",
            ErrorKind::Schema => "schema",
            ErrorKind::Constraint => "constraint",
            ErrorKind::AlreadyRunning => "already_running",
        };
        write!(f, "{}", s)
    }
}

/// Errors raised by the state machine when a transition is not in the table.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid transition from '{from}' on event '{event}'")]
    InvalidTransition { from: String, event: String },

    #[error("Run is already terminal in state '{state}'")]
    AlreadyTerminal { state: String },
}

/// Exponential backoff delay for a retry attempt, without jitter.
///
/// Attempt numbering starts at 1; the delay doubles per attempt from
/// `base_ms` and is capped at `cap_ms`. With the default base of 30s the
/// sequence is 30s, 60s, 120s.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(exp.min(cap_ms))
}

/// Backoff delay with a uniform random jitter of up to
/// `jitter_fraction` of the base delay added on top.
///
/// A non-positive fraction disables jitter, which keeps retry timing
/// deterministic under test.
pub fn backoff_delay_jittered(
    attempt: u32,
    base_ms: u64,
    cap_ms: u64,
    jitter_fraction: f64,
) -> Duration {
    let delay = backoff_delay(attempt, base_ms, cap_ms);
    if jitter_fraction <= 0.0 {
        return delay;
    }
    use rand::RngExt;
    let spread_ms = (delay.as_millis() as f64 * jitter_fraction).max(0.0) as u64;
    let mut rng = rand::rng();
    delay + Duration::from_millis(rng.random_range(0..=spread_ms))
}
