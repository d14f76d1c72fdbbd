//! In-memory run store.
//!
//! Backs tests and dry runs with the same lease and bookkeeping semantics
//! as the PostgreSQL store, minus persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::run::{PipelineRun, RunStatus, StageResult};

use super::store::{QuarantineRecord, RunFilter, RunStore, RunSummary, StoreError};

/// In-memory implementation of [`RunStore`].
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, PipelineRun>>,
    leases: Mutex<HashMap<(String, NaiveDate), Uuid>>,
    quarantine: Mutex<Vec<QuarantineRecord>>,
}

impl MemoryRunStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leases currently held.
    pub fn lease_count(&self) -> usize {
        self.leases.lock().expect("run store lock poisoned").len()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn acquire_lease(
        &self,
        entity_group: &str,
        process_date: NaiveDate,
        run_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().expect("run store lock poisoned");
        let key = (entity_group.to_string(), process_date);
        if leases.contains_key(&key) {
            return Err(StoreError::LeaseHeld {
                entity_group: entity_group.to_string(),
                process_date,
            });
        }
        leases.insert(key, run_id);
        Ok(())
    }

    async fn release_lease(
        &self,
        entity_group: &str,
        process_date: NaiveDate,
    ) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().expect("run store lock poisoned");
        leases.remove(&(entity_group.to_string(), process_date));
        Ok(())
    }

    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("Run {}", run_id)))?;
        if run.status == RunStatus::Running {
            run.status = status;
            run.error = error.map(|e| e.to_string());
            run.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_stage(&self, run_id: Uuid, stage: &StageResult) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("Run {}", run_id)))?;
        if let Some(existing) = run.stages.iter_mut().find(|s| s.stage == stage.stage) {
            *existing = stage.clone();
        } else {
            run.stages.push(stage.clone());
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        let runs = self.runs.lock().expect("run store lock poisoned");
        Ok(runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let runs = self.runs.lock().expect("run store lock poisoned");
        let mut matched: Vec<&PipelineRun> = runs
            .values()
            .filter(|run| {
                filter
                    .entity_group
                    .as_ref()
                    .map_or(true, |g| &run.entity_group == g)
                    && filter.process_date.map_or(true, |d| run.process_date == d)
                    && filter.status.map_or(true, |s| run.status == s)
            })
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);

        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|run| RunSummary {
                id: run.id,
                entity_group: run.entity_group.clone(),
                process_date: run.process_date,
                environment: run.environment.clone(),
                status: run.status,
                started_at: run.started_at,
                finished_at: run.finished_at,
            })
            .collect())
    }

    async fn active_run(
        &self,
        entity_group: &str,
        process_date: NaiveDate,
    ) -> Result<Option<Uuid>, StoreError> {
        let leases = self.leases.lock().expect("run store lock poisoned");
        Ok(leases.get(&(entity_group.to_string(), process_date)).copied())
    }

    async fn insert_quarantine(&self, record: &QuarantineRecord) -> Result<(), StoreError> {
        let mut quarantine = self.quarantine.lock().expect("run store lock poisoned");
        quarantine.push(record.clone());
        Ok(())
    }

    async fn list_quarantine(
        &self,
        process_date: NaiveDate,
    ) -> Result<Vec<QuarantineRecord>, StoreError> {
        let quarantine = self.quarantine.lock().expect("run store lock poisoned");
        let mut matched: Vec<QuarantineRecord> = quarantine
            .iter()
            .filter(|r| r.process_date == process_date)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.quarantined_at.cmp(&a.quarantined_at));
        Ok(matched)
    }
}
