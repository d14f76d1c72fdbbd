//! Quality gate verdicts and reports.
//!
//! A [`QualityReport`] is the complete record of one gate evaluation: one
//! [`EntityReport`] per entity in the run, each holding the results of the
//! individual checks. Reports are serialized alongside quarantined data so
//! an operator can see exactly why a partition was held back.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The checks the gate runs over a curated partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Schema,
    NullRate,
    DuplicateRate,
    ReferentialIntegrity,
    Freshness,
    RowCount,
    ValueRange,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckKind::Schema => "schema",
            CheckKind::NullRate => "null_rate",
            CheckKind::DuplicateRate => "duplicate_rate",
            CheckKind::ReferentialIntegrity => "referential_integrity",
            CheckKind::Freshness => "freshness",
            CheckKind::RowCount => "row_count",
            CheckKind::ValueRange => "value_range",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a single check. `Warn` is recorded and reported but does
/// not block promotion; `Fail` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        };
        write!(f, "{}", s)
    }
}

/// Result of one check over one entity's partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub status: CheckStatus,
    pub message: String,
    /// Measured value, when the check is a rate or count comparison.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Bounded sample of offending keys, for diagnosis without dumping
    /// whole partitions into reports.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub samples: Vec<String>,
}

impl CheckResult {
    pub fn pass(check: CheckKind, message: impl Into<String>) -> Self {
        Self::with_status(check, CheckStatus::Pass, message)
    }

    pub fn warn(check: CheckKind, message: impl Into<String>) -> Self {
        Self::with_status(check, CheckStatus::Warn, message)
    }

    pub fn fail(check: CheckKind, message: impl Into<String>) -> Self {
        Self::with_status(check, CheckStatus::Fail, message)
    }

    fn with_status(check: CheckKind, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            check,
            status,
            message: message.into(),
            observed: None,
            threshold: None,
            samples: Vec::new(),
        }
    }

    pub fn with_observed(mut self, observed: f64, threshold: f64) -> Self {
        self.observed = Some(observed);
        self.threshold = Some(threshold);
        self
    }

    pub fn with_samples(mut self, samples: Vec<String>) -> Self {
        self.samples = samples;
        self
    }

    pub fn failed(&self) -> bool {
        self.status == CheckStatus::Fail
    }
}

/// All check results for one entity's partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity: String,
    pub row_count: u64,
    pub checks: Vec<CheckResult>,
}

impl EntityReport {
    pub fn new(entity: impl Into<String>, row_count: u64) -> Self {
        Self {
            entity: entity.into(),
            row_count,
            checks: Vec::new(),
        }
    }

    pub fn push(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    /// Worst status across this entity's checks.
    pub fn verdict(&self) -> CheckStatus {
        let mut verdict = CheckStatus::Pass;
        for check in &self.checks {
            match check.status {
                CheckStatus::Fail => return CheckStatus::Fail,
                CheckStatus::Warn => verdict = CheckStatus::Warn,
                CheckStatus::Pass => {}
            }
        }
        verdict
    }

    /// Names of the checks that failed, for alerts and quarantine records.
    pub fn failing_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.failed())
            .map(|c| c.check.to_string())
            .collect()
    }
}

/// The full gate evaluation for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub entity_group: String,
    pub process_date: NaiveDate,
    pub run_id: Uuid,
    /// The instant the gate evaluated against; the freshness check
    /// compares event times to this same value.
    pub evaluated_at: DateTime<Utc>,
    pub entities: Vec<EntityReport>,
}

impl QualityReport {
    pub fn new(
        entity_group: impl Into<String>,
        process_date: NaiveDate,
        run_id: Uuid,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_group: entity_group.into(),
            process_date,
            run_id,
            evaluated_at,
            entities: Vec::new(),
        }
    }

    pub fn push(&mut self, entity: EntityReport) {
        self.entities.push(entity);
    }

    /// The gate passes only when no entity has a failing check.
    pub fn passed(&self) -> bool {
        self.verdict() != CheckStatus::Fail
    }

    /// Worst status across all entities.
    pub fn verdict(&self) -> CheckStatus {
        let mut verdict = CheckStatus::Pass;
        for entity in &self.entities {
            match entity.verdict() {
                CheckStatus::Fail => return CheckStatus::Fail,
                CheckStatus::Warn => verdict = CheckStatus::Warn,
                CheckStatus::Pass => {}
            }
        }
        verdict
    }

    /// Reports for entities whose verdict is `Fail`.
    pub fn failing_entities(&self) -> Vec<&EntityReport> {
        self.entities
            .iter()
            .filter(|e| e.verdict() == CheckStatus::Fail)
            .collect()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity == name)
    }

    /// One-line summary for logs and notifications.
    pub fn summary(&self) -> String {
        let failing = self.failing_entities();
        if failing.is_empty() {
            format!(
                "quality gate passed for {} entities on {}",
                self.entities.len(),
                self.process_date
            )
        } else {
            let names: Vec<&str> = failing.iter().map(|e| e.entity.as_str()).collect();
            format!(
                "quality gate failed for {} of {} entities on {}: {}",
                failing.len(),
                self.entities.len(),
                self.process_date,
                names.join(", ")
            )
        }
    }
}
