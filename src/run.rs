//! Run and stage records.
//!
//! A `PipelineRun` is created when a trigger is accepted and is append-only
//! after that: stage results accumulate in order, and the terminal status is
//! set exactly once. These records double as the run-history surface exposed
//! to observability consumers.

use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The run holds the lease and is executing stages.
    Running,
    /// Every stage through the warehouse load completed.
    Succeeded,
    /// A stage exhausted its retries or hit a fatal error.
    Failed,
    /// The quality gate failed and partitions were quarantined.
    Quarantined,
}

impl RunStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Quarantined => "quarantined",
        };
        write!(f, "{}", s)
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// The stages a run moves through, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    IngestCheck,
    RawToClean,
    CleanToCurated,
    QualityGate,
    Quarantine,
    CuratedToWarehouse,
    Notify,
}

impl StageKind {
    /// External job slug for stages backed by the stage executor; `None`
    /// for stages the orchestrator runs itself.
    pub fn job(&self) -> Option<&'static str> {
        match self {
            StageKind::IngestCheck => Some("ingest-check"),
            StageKind::RawToClean => Some("raw-to-clean"),
            StageKind::CleanToCurated => Some("clean-to-curated"),
            StageKind::CuratedToWarehouse => Some("curated-to-warehouse"),
            StageKind::QualityGate | StageKind::Quarantine | StageKind::Notify => None,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::IngestCheck => "ingest_check",
            StageKind::RawToClean => "raw_to_clean",
            StageKind::CleanToCurated => "clean_to_curated",
            StageKind::QualityGate => "quality_gate",
            StageKind::Quarantine => "quarantine",
            StageKind::CuratedToWarehouse => "curated_to_warehouse",
            StageKind::Notify => "notify",
        };
        write!(f, "{}", s)
    }
}

/// Process date requested by a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessDate {
    /// Resolve to yesterday (UTC) at run start.
    Auto,
    /// An explicit calendar date.
    On(NaiveDate),
}

impl ProcessDate {
    /// Resolves to a concrete date relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> NaiveDate {
        match self {
            ProcessDate::On(date) => *date,
            ProcessDate::Auto => now
                .date_naive()
                .checked_sub_days(Days::new(1))
                .unwrap_or_else(|| now.date_naive()),
        }
    }
}

impl std::str::FromStr for ProcessDate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ProcessDate::Auto);
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(ProcessDate::On)
            .map_err(|_| format!("expected 'auto' or YYYY-MM-DD, got '{}'", s))
    }
}

impl std::fmt::Display for ProcessDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessDate::Auto => write!(f, "auto"),
            ProcessDate::On(date) => write!(f, "{}", date),
        }
    }
}

/// A request to start a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTrigger {
    /// Requested process date.
    pub process_date: ProcessDate,
    /// Environment override; the configured environment applies if unset.
    pub environment: Option<String>,
    /// Who or what asked for the run.
    pub triggered_by: String,
}

impl RunTrigger {
    /// Creates a manual trigger for a process date.
    pub fn new(process_date: ProcessDate) -> Self {
        Self {
            process_date,
            environment: None,
            triggered_by: "manual".to_string(),
        }
    }

    /// Creates the daily scheduled trigger (auto date).
    pub fn scheduled() -> Self {
        Self {
            process_date: ProcessDate::Auto,
            environment: None,
            triggered_by: "schedule".to_string(),
        }
    }

    /// Sets the environment override.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Sets the trigger source.
    pub fn with_triggered_by(mut self, source: impl Into<String>) -> Self {
        self.triggered_by = source.into();
        self
    }
}

/// Result of one stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: StageStatus,
    /// Attempts consumed, first attempt included.
    pub attempts: u32,
    pub records_in: u64,
    pub records_out: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StageResult {
    /// Marks a stage as started now.
    pub fn started(stage: StageKind) -> Self {
        Self {
            stage,
            status: StageStatus::Running,
            attempts: 0,
            records_in: 0,
            records_out: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Finishes the stage as succeeded.
    pub fn succeed(mut self, records_in: u64, records_out: u64, attempts: u32) -> Self {
        self.status = StageStatus::Succeeded;
        self.records_in = records_in;
        self.records_out = records_out;
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Finishes the stage as failed.
    pub fn fail(mut self, attempts: u32, error: impl Into<String>) -> Self {
        self.status = StageStatus::Failed;
        self.attempts = attempts;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        self
    }

    /// Wall-clock duration, if the stage has finished.
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .map(|end| (end - self.started_at).to_std().unwrap_or(Duration::ZERO))
    }
}

/// One execution of the pipeline for an (entity group, process date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub entity_group: String,
    pub process_date: NaiveDate,
    pub environment: String,
    pub triggered_by: String,
    pub status: RunStatus,
    /// Stage results in execution order.
    pub stages: Vec<StageResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl PipelineRun {
    /// Creates a new running record with a fresh id.
    pub fn new(
        entity_group: impl Into<String>,
        process_date: NaiveDate,
        environment: impl Into<String>,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_group: entity_group.into(),
            process_date,
            environment: environment.into(),
            triggered_by: triggered_by.into(),
            status: RunStatus::Running,
            stages: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Appends a finished stage result.
    pub fn push_stage(&mut self, stage: StageResult) {
        self.stages.push(stage);
    }

    /// Sets the terminal status. Ignored if the run is already terminal;
    /// terminal records are never rewritten.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Whether the run has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The recorded result for a stage, if it executed.
    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    /// Wall-clock duration, if the run has finished.
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .map(|end| (end - self.started_at).to_std().unwrap_or(Duration::ZERO))
    }
}
