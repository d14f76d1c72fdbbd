//! Run store trait and shared control-plane types.
//!
//! `RunStore` is the seam between the orchestrator and run bookkeeping:
//! lease acquisition, run and stage records, and the quarantine ledger.
//! `Database` implements it over PostgreSQL; `MemoryRunStore` implements
//! it over in-process maps for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::run::{PipelineRun, RunStatus, StageResult};

/// Errors that can occur during control-plane storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Another run already holds the lease for this group and date.
    #[error("Run already in progress for '{entity_group}' on {process_date}")]
    LeaseHeld {
        entity_group: String,
        process_date: NaiveDate,
    },

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

impl StoreError {
    /// Maps this error onto the pipeline failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::LeaseHeld { .. } => ErrorKind::AlreadyRunning,
            StoreError::ConnectionFailed(_) | StoreError::QueryFailed(_) => ErrorKind::Transient,
            StoreError::NotFound(_) => ErrorKind::Constraint,
            StoreError::Serialization(_) | StoreError::Migration(_) => ErrorKind::Schema,
        }
    }
}

/// A quarantined partition, recorded once per entity per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Run that quarantined the partition.
    pub run_id: Uuid,
    /// Entity whose curated partition failed the gate.
    pub entity: String,
    /// Process date of the partition.
    pub process_date: NaiveDate,
    /// Where the quarantined copy landed.
    pub location: String,
    /// Names of the checks that failed.
    pub failing_checks: Vec<String>,
    /// When the partition was quarantined.
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantineRecord {
    /// Creates a new quarantine record timestamped now.
    pub fn new(
        run_id: Uuid,
        entity: impl Into<String>,
        process_date: NaiveDate,
        location: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            entity: entity.into(),
            process_date,
            location: location.into(),
            failing_checks: Vec::new(),
            quarantined_at: Utc::now(),
        }
    }

    /// Sets the failing check names.
    pub fn with_failing_checks(mut self, checks: Vec<String>) -> Self {
        self.failing_checks = checks;
        self
    }
}

/// Filter criteria for listing runs.
#[derive(Debug, Default, Clone)]
pub struct RunFilter {
    /// Filter by entity group.
    pub entity_group: Option<String>,
    /// Filter by process date.
    pub process_date: Option<NaiveDate>,
    /// Filter by run status.
    pub status: Option<RunStatus>,
    /// Maximum number of results.
    pub limit: Option<i64>,
    /// Offset for pagination.
    pub offset: Option<i64>,
}

impl RunFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entity group filter.
    pub fn with_entity_group(mut self, entity_group: impl Into<String>) -> Self {
        self.entity_group = Some(entity_group.into());
        self
    }

    /// Sets the process date filter.
    pub fn with_process_date(mut self, process_date: NaiveDate) -> Self {
        self.process_date = Some(process_date);
        self
    }

    /// Sets the status filter.
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the result limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset for pagination.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Metadata about a run (without stage results).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique identifier.
    pub id: Uuid,
    /// Entity group the run covered.
    pub entity_group: String,
    /// Process date the run covered.
    pub process_date: NaiveDate,
    /// Environment the run executed in.
    pub environment: String,
    /// Terminal or current status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished, if it has.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistent store for runs, leases, and the quarantine ledger.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Acquires the run lease for an entity group and process date.
    ///
    /// Acquisition is atomic: of two concurrent callers exactly one wins,
    /// and the loser gets [`StoreError::LeaseHeld`].
    async fn acquire_lease(
        &self,
        entity_group: &str,
        process_date: NaiveDate,
        run_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Releases the lease. Releasing a lease that is not held is a no-op.
    async fn release_lease(
        &self,
        entity_group: &str,
        process_date: NaiveDate,
    ) -> Result<(), StoreError>;

    /// Inserts a freshly created run record.
    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Sets the terminal status of a run. Only a running run is updated;
    /// a run that already reached a terminal status keeps it.
    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Records a stage result, replacing any earlier record for the same
    /// stage of the same run.
    async fn record_stage(&self, run_id: Uuid, stage: &StageResult) -> Result<(), StoreError>;

    /// Retrieves a run with its stage results. Returns `None` if the run
    /// doesn't exist.
    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    /// Lists runs matching the given filter, most recent first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError>;

    /// Returns the id of the run currently holding the lease, if any.
    async fn active_run(
        &self,
        entity_group: &str,
        process_date: NaiveDate,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Appends a quarantine record to the ledger.
    async fn insert_quarantine(&self, record: &QuarantineRecord) -> Result<(), StoreError>;

    /// Lists quarantine records for a process date, most recent first.
    async fn list_quarantine(
        &self,
        process_date: NaiveDate,
    ) -> Result<Vec<QuarantineRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_run_filter_builder() {
        let filter = RunFilter::new()
            .with_entity_group("customer360")
            .with_process_date(date(2024, 1, 15))
            .with_status(RunStatus::Failed)
            .with_limit(10)
            .with_offset(20);

        assert_eq!(filter.entity_group, Some("customer360".to_string()));
        assert_eq!(filter.process_date, Some(date(2024, 1, 15)));
        assert_eq!(filter.status, Some(RunStatus::Failed));
        assert_eq!(filter.limit, Some(10));
        assert_eq!(filter.offset, Some(20));
    }

    #[test]
    fn test_quarantine_record_builder() {
        let run_id = Uuid::new_v4();
        let record = QuarantineRecord::new(
            run_id,
            "transactions",
            date(2024, 1, 15),
            "quarantine/transactions/year=2024/month=01/day=15",
        )
        .with_failing_checks(vec!["null_rate".to_string(), "duplicate_rate".to_string()]);

        assert_eq!(record.run_id, run_id);
        assert_eq!(record.entity, "transactions");
        assert_eq!(record.failing_checks.len(), 2);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::LeaseHeld {
            entity_group: "customer360".to_string(),
            process_date: date(2024, 1, 15),
        };
        assert!(err.to_string().contains("customer360"));
        assert!(err.to_string().contains("2024-01-15"));

        let err = StoreError::ConnectionFailed("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_store_error_kinds() {
        let held = StoreError::LeaseHeld {
            entity_group: "customer360".to_string(),
            process_date: date(2024, 1, 15),
        };
        assert_eq!(held.kind(), ErrorKind::AlreadyRunning);
        assert!(!held.kind().is_retryable());

        let conn = StoreError::ConnectionFailed("timeout".to_string());
        assert_eq!(conn.kind(), ErrorKind::Transient);
        assert!(conn.kind().is_retryable());
    }
}
