//! Typed state machine for pipeline runs.
//!
//! Every run walks the same transition table: ingest check, the two lake
//! promotion stages, the quality gate, then either the warehouse load or
//! quarantine, and finally notification. The table is encoded as an
//! exhaustive match so an impossible transition is a compile-time hole,
//! not a runtime surprise. Terminal states accept no further events.

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::run::{RunStatus, StageKind};

/// Final disposition of a run, decided before the notify stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Quarantined,
}

impl RunOutcome {
    /// The run status this outcome resolves to once notification completes.
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Failed => RunStatus::Failed,
            RunOutcome::Quarantined => RunStatus::Quarantined,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Quarantined => "quarantined",
        };
        write!(f, "{}", s)
    }
}

/// States a run moves through. `Notify` carries the outcome the run will
/// resolve to so the notification stage knows what it is announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    IngestCheck,
    RawToClean,
    CleanToCurated,
    QualityGate,
    CuratedToWarehouse,
    Quarantine,
    Notify(RunOutcome),
    Done(RunOutcome),
}

/// Events that drive the machine. Stage events come from the executor,
/// gate events from the quality gate, and `Cancelled` from the cancel
/// handle checked at each state boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    StageSucceeded,
    StageFailed,
    GatePassed,
    GateFailed,
    QuarantineComplete,
    Notified,
    Cancelled,
}

impl std::fmt::Display for RunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunEvent::StageSucceeded => "stage_succeeded",
            RunEvent::StageFailed => "stage_failed",
            RunEvent::GatePassed => "gate_passed",
            RunEvent::GateFailed => "gate_failed",
            RunEvent::QuarantineComplete => "quarantine_complete",
            RunEvent::Notified => "notified",
            RunEvent::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl RunState {
    /// Entry state for every run.
    pub fn initial() -> Self {
        RunState::IngestCheck
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done(_))
    }

    /// The outcome this state has committed to, if any.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            RunState::Notify(outcome) | RunState::Done(outcome) => Some(*outcome),
            _ => None,
        }
    }

    /// The stage record this state produces when the orchestrator works it.
    /// Terminal states do no work and map to `None`.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            RunState::IngestCheck => Some(StageKind::IngestCheck),
            RunState::RawToClean => Some(StageKind::RawToClean),
            RunState::CleanToCurated => Some(StageKind::CleanToCurated),
            RunState::QualityGate => Some(StageKind::QualityGate),
            RunState::Quarantine => Some(StageKind::Quarantine),
            RunState::CuratedToWarehouse => Some(StageKind::CuratedToWarehouse),
            RunState::Notify(_) => Some(StageKind::Notify),
            RunState::Done(_) => None,
        }
    }

    /// Apply an event, returning the next state or rejecting the pair.
    ///
    /// The match below is the transition table. Stage failures from any
    /// executor-backed stage and cancellation from any working state both
    /// route to `Notify(Failed)` so exactly one notification is produced
    /// for a failed run.
    pub fn apply(self, event: RunEvent) -> Result<RunState, TransitionError> {
        if let RunState::Done(_) = self {
            return Err(TransitionError::AlreadyTerminal {
                state: self.to_string(),
            });
        }

        let next = match (self, event) {
            (RunState::IngestCheck, RunEvent::StageSucceeded) => RunState::RawToClean,
            (RunState::RawToClean, RunEvent::StageSucceeded) => RunState::CleanToCurated,
            (RunState::CleanToCurated, RunEvent::StageSucceeded) => RunState::QualityGate,

            (RunState::QualityGate, RunEvent::GatePassed) => RunState::CuratedToWarehouse,
            (RunState::QualityGate, RunEvent::GateFailed) => RunState::Quarantine,

            (RunState::CuratedToWarehouse, RunEvent::StageSucceeded) => {
                RunState::Notify(RunOutcome::Succeeded)
            }
            (RunState::Quarantine, RunEvent::QuarantineComplete) => {
                RunState::Notify(RunOutcome::Quarantined)
            }

            // A failure anywhere, the gate evaluator erroring out, or the
            // quarantine sink failing all end the run as failed.
            (
                RunState::IngestCheck
                | RunState::RawToClean
                | RunState::CleanToCurated
                | RunState::QualityGate
                | RunState::CuratedToWarehouse
                | RunState::Quarantine,
                RunEvent::StageFailed,
            ) => RunState::Notify(RunOutcome::Failed),

            // Cancellation is honored at state boundaries, before notify.
            (
                RunState::IngestCheck
                | RunState::RawToClean
                | RunState::CleanToCurated
                | RunState::QualityGate
                | RunState::CuratedToWarehouse
                | RunState::Quarantine,
                RunEvent::Cancelled,
            ) => RunState::Notify(RunOutcome::Failed),

            (RunState::Notify(outcome), RunEvent::Notified) => RunState::Done(outcome),

            (from, event) => {
                return Err(TransitionError::InvalidTransition {
                    from: from.to_string(),
                    event: event.to_string(),
                })
            }
        };

        Ok(next)
    }

    /// Whether `event` is accepted in this state.
    pub fn accepts(&self, event: RunEvent) -> bool {
        self.apply(event).is_ok()
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::IngestCheck => write!(f, "ingest_check"),
            RunState::RawToClean => write!(f, "raw_to_clean"),
            RunState::CleanToCurated => write!(f, "clean_to_curated"),
            RunState::QualityGate => write!(f, "quality_gate"),
            RunState::CuratedToWarehouse => write!(f, "curated_to_warehouse"),
            RunState::Quarantine => write!(f, "quarantine"),
            RunState::Notify(_) => write!(f, "notify"),
            RunState::Done(outcome) => write!(f, "{}", outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_walks_full_table() {
        let mut state = RunState::initial();
        for event in [
            RunEvent::StageSucceeded,
            RunEvent::StageSucceeded,
            RunEvent::StageSucceeded,
            RunEvent::GatePassed,
            RunEvent::StageSucceeded,
            RunEvent::Notified,
        ] {
            state = state.apply(event).unwrap();
        }
        assert_eq!(state, RunState::Done(RunOutcome::Succeeded));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_gate_failure_routes_through_quarantine() {
        let state = RunState::QualityGate
            .apply(RunEvent::GateFailed)
            .unwrap()
            .apply(RunEvent::QuarantineComplete)
            .unwrap();
        assert_eq!(state, RunState::Notify(RunOutcome::Quarantined));
        assert_eq!(
            state.apply(RunEvent::Notified).unwrap(),
            RunState::Done(RunOutcome::Quarantined)
        );
    }

    #[test]
    fn test_stage_failure_short_circuits_to_notify() {
        for state in [
            RunState::IngestCheck,
            RunState::RawToClean,
            RunState::CleanToCurated,
            RunState::CuratedToWarehouse,
        ] {
            let next = state.apply(RunEvent::StageFailed).unwrap();
            assert_eq!(next, RunState::Notify(RunOutcome::Failed));
        }
    }

    #[test]
    fn test_gate_evaluator_error_fails_run() {
        let next = RunState::QualityGate.apply(RunEvent::StageFailed).unwrap();
        assert_eq!(next, RunState::Notify(RunOutcome::Failed));
    }

    #[test]
    fn test_cancellation_fails_run_from_any_working_state() {
        for state in [
            RunState::IngestCheck,
            RunState::QualityGate,
            RunState::Quarantine,
            RunState::CuratedToWarehouse,
        ] {
            let next = state.apply(RunEvent::Cancelled).unwrap();
            assert_eq!(next, RunState::Notify(RunOutcome::Failed));
        }
    }

    #[test]
    fn test_terminal_state_rejects_all_events() {
        let state = RunState::Done(RunOutcome::Succeeded);
        let err = state.apply(RunEvent::StageSucceeded).unwrap_err();
        assert!(err.to_string().contains("already terminal"));
    }

    #[test]
    fn test_unexpected_event_is_rejected() {
        let err = RunState::IngestCheck.apply(RunEvent::GatePassed).unwrap_err();
        assert!(err.to_string().contains("Invalid transition"));
        assert!(err.to_string().contains("ingest_check"));

        let err = RunState::CuratedToWarehouse
            .apply(RunEvent::GateFailed)
            .unwrap_err();
        assert!(err.to_string().contains("curated_to_warehouse"));
    }

    #[test]
    fn test_notify_is_not_cancellable() {
        let state = RunState::Notify(RunOutcome::Succeeded);
        assert!(!state.accepts(RunEvent::Cancelled));
        assert!(state.accepts(RunEvent::Notified));
    }

    #[test]
    fn test_notify_carries_pending_outcome() {
        let state = RunState::Notify(RunOutcome::Quarantined);
        assert_eq!(state.outcome(), Some(RunOutcome::Quarantined));
        assert_eq!(state.outcome().unwrap().status(), RunStatus::Quarantined);
        assert!(RunState::QualityGate.outcome().is_none());
    }

    #[test]
    fn test_states_map_to_stage_records() {
        assert_eq!(RunState::IngestCheck.stage(), Some(StageKind::IngestCheck));
        assert_eq!(RunState::QualityGate.stage(), Some(StageKind::QualityGate));
        assert_eq!(RunState::Quarantine.stage(), Some(StageKind::Quarantine));
        assert_eq!(
            RunState::Notify(RunOutcome::Failed).stage(),
            Some(StageKind::Notify)
        );
        assert_eq!(RunState::Done(RunOutcome::Failed).stage(), None);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(RunState::initial().to_string(), "ingest_check");
        assert_eq!(RunState::Done(RunOutcome::Failed).to_string(), "failed");
        assert_eq!(RunEvent::GateFailed.to_string(), "gate_failed");
    }
}
