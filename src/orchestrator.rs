//! Run sequencing for the lake-to-warehouse pipeline.
//!
//! The orchestrator drives one [`PipelineRun`] through the state machine in
//! [`crate::fsm`]: it dispatches transform jobs to the stage executor,
//! evaluates the quality gate over curated data, routes failing partitions
//! to quarantine, and promotes passing data into the warehouse through the
//! merge engine. A lease keyed by (entity group, process date) guarantees
//! at most one concurrent run per date; transient stage failures are
//! retried with exponential backoff and jitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertSink, Severity};
use crate::catalog::{value_to_key, CatalogError, EntityCatalog};
use crate::config::PipelineConfig;
use crate::error::{backoff_delay_jittered, ErrorKind, TransitionError};
use crate::fsm::{RunEvent, RunOutcome, RunState};
use crate::lake::{LakeError, LakeStore};
use crate::metrics::MetricsCollector;
use crate::partition::{LakeLayer, Partition};
use crate::quality::{DimensionSnapshot, QualityGate, QualityReport};
use crate::quarantine::{QuarantineError, QuarantineSink};
use crate::run::{PipelineRun, RunStatus, RunTrigger, StageKind, StageResult};
use crate::stage::{StageExecutor, StageRequest, StageResponse};
use crate::storage::{RunStore, StoreError};
use crate::warehouse::{MergeEngine, MergeError, MergeOutcome, WarehouseError, WarehouseStore};

/// Errors terminating a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Lease acquisition or run bookkeeping failed.
    #[error("Run store error: {0}")]
    Store(#[from] StoreError),

    /// A stage exhausted its retry budget or failed on a non-retryable
    /// error kind.
    #[error("Stage '{stage}' failed after {attempts} attempt(s): {message}")]
    StageFailed {
        stage: StageKind,
        attempts: u32,
        message: String,
        kind: ErrorKind,
    },

    /// Curated data could not be read for the quality gate.
    #[error("Lake error: {0}")]
    Lake(#[from] LakeError),

    /// Isolation of a failing partition did not complete.
    #[error("Quarantine error: {0}")]
    Quarantine(#[from] QuarantineError),

    /// Warehouse promotion failed.
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// Warehouse access outside the merge protocol failed.
    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    /// The entity catalog rejected a lookup.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// The state machine rejected an event.
    #[error("State machine error: {0}")]
    Transition(#[from] TransitionError),

    /// The run observed a cancellation request at a state boundary.
    #[error("Run cancelled while in state '{0}'")]
    Cancelled(String),
}

impl PipelineError {
    /// Classifies the error for retry and alerting decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Store(e) => e.kind(),
            PipelineError::StageFailed { kind, .. } => *kind,
            PipelineError::Lake(_) => ErrorKind::Transient,
            PipelineError::Quarantine(e) => e.kind(),
            PipelineError::Merge(e) => e.kind(),
            PipelineError::Warehouse(e) => match e {
                WarehouseError::ConnectionFailed(_) | WarehouseError::QueryFailed(_) => {
                    ErrorKind::Transient
                }
                _ => ErrorKind::Schema,
            },
            PipelineError::Catalog(_) => ErrorKind::Schema,
            PipelineError::Transition(_) => ErrorKind::Schema,
            PipelineError::Cancelled(_) => ErrorKind::Transient,
        }
    }
}

/// Cooperative cancellation flag shared with a running pipeline.
///
/// Cancellation is observed only between state transitions; an in-flight
/// executor job is never interrupted. Partitions already written stay in
/// place for the next run to overwrite.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Takes effect at the next state boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Drives pipeline runs for one entity group.
///
/// All collaborators are trait objects so tests can substitute in-memory
/// doubles for the run store, the warehouse, the executor, and the alert
/// sink.
pub struct Orchestrator {
    config: PipelineConfig,
    catalog: EntityCatalog,
    store: Arc<dyn RunStore>,
    executor: Arc<dyn StageExecutor>,
    warehouse: Arc<dyn WarehouseStore>,
    lake: Arc<LakeStore>,
    alerts: Arc<dyn AlertSink>,
    gate: QualityGate,
    merge: MergeEngine,
    sink: QuarantineSink,
    metrics: MetricsCollector,
    cancel: CancelHandle,
    /// Serializes warehouse merges across concurrent runs. Two backfill
    /// dates may run their lake stages in parallel, but never their merges
    /// against the shared target tables.
    merge_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        catalog: EntityCatalog,
        store: Arc<dyn RunStore>,
        executor: Arc<dyn StageExecutor>,
        warehouse: Arc<dyn WarehouseStore>,
        lake: Arc<LakeStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let gate = QualityGate::from_config(&config);
        let merge = MergeEngine::new(Arc::clone(&warehouse));
        let sink = QuarantineSink::new(Arc::clone(&lake), Arc::clone(&store), Arc::clone(&alerts));

        Self {
            config,
            catalog,
            store,
            executor,
            warehouse,
            lake,
            alerts,
            gate,
            merge,
            sink,
            metrics: MetricsCollector,
            cancel: CancelHandle::new(),
            merge_lock: Mutex::new(()),
        }
    }

    /// A handle callers can use to request cancellation of runs driven by
    /// this orchestrator.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    /// Creates a run record and acquires the concurrency lease.
    ///
    /// Fails with [`StoreError::LeaseHeld`] when another run is active for
    /// the same (entity group, process date); no run record is created in
    /// that case.
    pub async fn start(&self, trigger: &RunTrigger) -> Result<PipelineRun, PipelineError> {
        let process_date = trigger.process_date.resolve(Utc::now());
        let environment = trigger
            .environment
            .clone()
            .unwrap_or_else(|| self.config.environment.clone());

        let run = PipelineRun::new(
            &self.catalog.group,
            process_date,
            environment,
            &trigger.triggered_by,
        );

        if let Err(e) = self
            .store
            .acquire_lease(&self.catalog.group, process_date, run.id)
            .await
        {
            if matches!(e, StoreError::LeaseHeld { .. }) {
                let holder = self
                    .store
                    .active_run(&self.catalog.group, process_date)
                    .await
                    .ok()
                    .flatten();
                warn!(
                    process_date = %process_date,
                    holder = ?holder,
                    "Trigger rejected, date already leased"
                );
            }
            return Err(e.into());
        }

        if let Err(e) = self.store.insert_run(&run).await {
            // Give the lease back so a failed insert does not wedge the date.
            if let Err(release) = self
                .store
                .release_lease(&self.catalog.group, process_date)
                .await
            {
                error!(run_id = %run.id, "Failed to release lease after insert failure: {release}");
            }
            return Err(e.into());
        }

        self.metrics.inc_active_runs();
        info!(
            run_id = %run.id,
            entity_group = %run.entity_group,
            process_date = %process_date,
            triggered_by = %run.triggered_by,
            "Pipeline run started"
        );

        Ok(run)
    }

    /// Executes a started run to its terminal state.
    ///
    /// The terminal status and the lease release are persisted even when
    /// the run fails mid-flight.
    pub async fn execute(&self, mut run: PipelineRun) -> Result<PipelineRun, PipelineError> {
        let timer = Instant::now();
        let driven = self.drive(&mut run).await;

        if !run.is_terminal() {
            // Only reachable when the state machine itself errored.
            let message = driven.as_ref().err().map(|e| e.to_string());
            run.finish(RunStatus::Failed, message);
        }

        let finalize = self.finalize_run(&run).await;
        self.metrics.dec_active_runs();
        self.metrics
            .record_run(&run.status.to_string(), timer.elapsed().as_secs_f64());

        match run.status {
            RunStatus::Succeeded => info!(
                run_id = %run.id,
                process_date = %run.process_date,
                "Pipeline run succeeded"
            ),
            status => warn!(
                run_id = %run.id,
                process_date = %run.process_date,
                status = %status,
                error = run.error.as_deref().unwrap_or("none"),
                "Pipeline run did not succeed"
            ),
        }

        driven?;
        finalize?;
        Ok(run)
    }

    /// Acquires the lease and runs the pipeline in one call.
    pub async fn run(&self, trigger: &RunTrigger) -> Result<PipelineRun, PipelineError> {
        let run = self.start(trigger).await?;
        self.execute(run).await
    }

    /// Re-runs the pipeline for every date in `[start, end]`, at most
    /// `backfill_concurrency` dates in flight. Dates whose lease is held
    /// surface as per-date errors without stopping the rest.
    pub async fn backfill(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<(NaiveDate, Result<PipelineRun, PipelineError>)> {
        let mut dates = Vec::new();
        let mut day = start;
        while day <= end {
            dates.push(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }

        info!(
            start = %start,
            end = %end,
            dates = dates.len(),
            concurrency = self.config.backfill_concurrency,
            "Starting backfill"
        );

        let mut results: Vec<(NaiveDate, Result<PipelineRun, PipelineError>)> =
            stream::iter(dates)
                .map(|date| async move {
                    let trigger = RunTrigger::new(crate::run::ProcessDate::On(date))
                        .with_triggered_by("backfill");
                    (date, self.run(&trigger).await)
                })
                .buffer_unordered(self.config.backfill_concurrency.max(1))
                .collect()
                .await;

        results.sort_by_key(|(date, _)| *date);
        results
    }

    /// Runs the state machine loop, mutating `run` as stages finish, and
    /// sets the terminal status on `run` before returning.
    async fn drive(&self, run: &mut PipelineRun) -> Result<RunOutcome, PipelineError> {
        let mut state = RunState::initial();
        let mut failure: Option<PipelineError> = None;
        let mut report: Option<QualityReport> = None;

        while !state.is_terminal() {
            if self.cancel.is_cancelled() && state.accepts(RunEvent::Cancelled) {
                warn!(run_id = %run.id, state = %state, "Cancellation observed at state boundary");
                failure.get_or_insert(PipelineError::Cancelled(state.to_string()));
                state = state.apply(RunEvent::Cancelled)?;
                continue;
            }

            let event = match state {
                RunState::IngestCheck => {
                    self.run_stage(run, StageKind::IngestCheck, &mut failure).await
                }
                RunState::RawToClean => {
                    self.run_stage(run, StageKind::RawToClean, &mut failure).await
                }
                RunState::CleanToCurated => {
                    self.run_stage(run, StageKind::CleanToCurated, &mut failure)
                        .await
                }
                RunState::QualityGate => {
                    self.run_quality_gate(run, &mut report, &mut failure).await
                }
                RunState::CuratedToWarehouse => {
                    self.run_warehouse_load(run, &mut failure).await
                }
                RunState::Quarantine => {
                    self.run_quarantine(run, report.as_ref(), &mut failure).await
                }
                RunState::Notify(outcome) => {
                    self.notify(run, outcome, failure.as_ref(), report.as_ref())
                        .await
                }
                RunState::Done(_) => break,
            };

            let next = state.apply(event)?;
            debug!(run_id = %run.id, from = %state, event = ?event, to = %next, "State transition");
            state = next;
        }

        let outcome = state.outcome().unwrap_or(RunOutcome::Failed);
        let error = match outcome {
            RunOutcome::Succeeded => None,
            RunOutcome::Failed => Some(
                failure
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "run failed without recorded error".to_string()),
            ),
            RunOutcome::Quarantined => match (&failure, &report) {
                (Some(e), _) => Some(e.to_string()),
                (None, Some(r)) => Some(r.summary()),
                (None, None) => Some("quality gate failed".to_string()),
            },
        };
        run.finish(outcome.status(), error);

        Ok(outcome)
    }

    /// Dispatches one executor-backed transform stage with retries.
    async fn run_stage(
        &self,
        run: &mut PipelineRun,
        stage: StageKind,
        failure: &mut Option<PipelineError>,
    ) -> RunEvent {
        let Some(request) = self.stage_request(stage, run.process_date) else {
            // Only executor-backed stage kinds are dispatched here.
            return RunEvent::StageSucceeded;
        };

        let result = StageResult::started(stage);
        self.persist_stage(run.id, &result).await;
        info!(
            run_id = %run.id,
            stage = %stage,
            job = %request.job_name,
            "Dispatching stage job"
        );

        let timer = Instant::now();
        match self.execute_with_retry(&request, stage).await {
            Ok((response, attempts)) => {
                let result = result.succeed(response.records_in, response.records_out, attempts);
                self.metrics
                    .record_stage(&stage.to_string(), "succeeded", timer.elapsed().as_secs_f64());
                info!(
                    run_id = %run.id,
                    stage = %stage,
                    records_in = response.records_in,
                    records_out = response.records_out,
                    attempts,
                    "Stage succeeded"
                );
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
                RunEvent::StageSucceeded
            }
            Err((err, attempts)) => {
                let result = result.fail(attempts, err.to_string());
                self.metrics
                    .record_stage(&stage.to_string(), "failed", timer.elapsed().as_secs_f64());
                error!(run_id = %run.id, stage = %stage, attempts, "Stage failed: {err}");
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
                failure.get_or_insert(err);
                RunEvent::StageFailed
            }
        }
    }

    /// Runs one stage request to completion or retry exhaustion.
    ///
    /// A response with failed status and an executor transport, HTTP, or
    /// timeout error are treated alike: the attempt failed. Job-reported
    /// failures are considered transient so an external re-run can
    /// succeed; non-retryable executor error kinds stop immediately.
    async fn execute_with_retry(
        &self,
        request: &StageRequest,
        stage: StageKind,
    ) -> Result<(StageResponse, u32), (PipelineError, u32)> {
        let base_ms = self.config.backoff_base.as_millis() as u64;
        let cap_ms = self.config.backoff_cap.as_millis() as u64;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let (message, kind) = match self.attempt_stage(request).await {
                Ok(response) if response.is_success() => return Ok((response, attempt)),
                Ok(response) => {
                    let message = response
                        .error_message
                        .unwrap_or_else(|| "job reported failure without detail".to_string());
                    (message, ErrorKind::Transient)
                }
                Err(e) => {
                    let kind = e.kind();
                    (e.to_string(), kind)
                }
            };

            if kind.is_retryable() && attempt < self.config.max_attempts {
                let delay = backoff_delay_jittered(
                    attempt,
                    base_ms,
                    cap_ms,
                    self.config.jitter_fraction,
                );
                warn!(
                    job = %request.job_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Stage attempt failed, retrying: {message}"
                );
                self.metrics.record_retry(&stage.to_string());
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err((
                PipelineError::StageFailed {
                    stage,
                    attempts: attempt,
                    message,
                    kind,
                },
                attempt,
            ));
        }
    }

    /// One executor call bounded by the configured stage timeout. A
    /// timeout counts as a failed, retryable attempt.
    async fn attempt_stage(
        &self,
        request: &StageRequest,
    ) -> Result<StageResponse, crate::stage::ExecutorError> {
        match tokio::time::timeout(self.config.stage_timeout, self.executor.execute(request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(crate::stage::ExecutorError::timeout(
                &request.job_name,
                self.config.stage_timeout,
            )),
        }
    }

    /// The executor request for a transform stage, or `None` for stages
    /// the orchestrator runs itself.
    fn stage_request(&self, stage: StageKind, process_date: NaiveDate) -> Option<StageRequest> {
        let job = stage.job()?;
        let (source, target) = match stage {
            StageKind::IngestCheck => (
                self.config.raw_root.display().to_string(),
                self.config.raw_root.display().to_string(),
            ),
            StageKind::RawToClean => (
                self.config.raw_root.display().to_string(),
                self.config.clean_root.display().to_string(),
            ),
            StageKind::CleanToCurated => (
                self.config.clean_root.display().to_string(),
                self.config.curated_root.display().to_string(),
            ),
            // The remaining executor-backed stage stages curated data into
            // the warehouse ahead of the merge.
            _ => (
                self.config.curated_root.display().to_string(),
                self.config.warehouse_url.clone(),
            ),
        };

        Some(StageRequest::new(
            self.config.job_name(job),
            process_date.to_string(),
            source,
            target,
        ))
    }

    /// Evaluates the quality gate over the day's curated partitions.
    async fn run_quality_gate(
        &self,
        run: &mut PipelineRun,
        report_slot: &mut Option<QualityReport>,
        failure: &mut Option<PipelineError>,
    ) -> RunEvent {
        let result = StageResult::started(StageKind::QualityGate);
        self.persist_stage(run.id, &result).await;

        let timer = Instant::now();
        match self.evaluate_gate(run).await {
            Ok(report) => {
                let rows: u64 = report.entities.iter().map(|e| e.row_count).sum();
                for entity in &report.entities {
                    for check in &entity.checks {
                        self.metrics
                            .record_gate_check(&check.check.to_string(), &check.status.to_string());
                    }
                }

                let passed = report.passed();
                let status = if passed { "succeeded" } else { "failed" };
                self.metrics.record_stage(
                    &StageKind::QualityGate.to_string(),
                    status,
                    timer.elapsed().as_secs_f64(),
                );

                let result = if passed {
                    info!(run_id = %run.id, rows, "Quality gate passed");
                    result.succeed(rows, rows, 1)
                } else {
                    let summary = report.summary();
                    warn!(run_id = %run.id, rows, "Quality gate failed: {summary}");
                    result.fail(1, summary)
                };
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);

                *report_slot = Some(report);
                if passed {
                    RunEvent::GatePassed
                } else {
                    RunEvent::GateFailed
                }
            }
            Err(e) => {
                let result = result.fail(1, e.to_string());
                self.metrics.record_stage(
                    &StageKind::QualityGate.to_string(),
                    "failed",
                    timer.elapsed().as_secs_f64(),
                );
                error!(run_id = %run.id, "Quality gate could not be evaluated: {e}");
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
                failure.get_or_insert(e);
                RunEvent::StageFailed
            }
        }
    }

    /// Loads curated partitions and the dimension snapshot, then runs the
    /// pure gate evaluator.
    ///
    /// The snapshot is the union of keys already in the warehouse and keys
    /// arriving in this run's curated dimension partitions; dimensions
    /// merge before facts, so facts may reference keys landing today.
    async fn evaluate_gate(&self, run: &PipelineRun) -> Result<QualityReport, PipelineError> {
        let mut rows_by_entity: HashMap<String, Vec<crate::lake::Record>> = HashMap::new();
        for entity in &self.catalog.entities {
            let partition = Partition::new(LakeLayer::Curated, &entity.name, run.process_date);
            let rows = if self.lake.has_data(&partition).await? {
                self.lake.read_partition(&partition).await?
            } else {
                Vec::new()
            };
            rows_by_entity.insert(entity.name.clone(), rows);
        }

        let mut snapshot = DimensionSnapshot::new();
        for dim in self.catalog.dimensions() {
            let mut keys = self.warehouse.natural_keys(&dim.warehouse_table).await?;
            if let Some(rows) = rows_by_entity.get(&dim.name) {
                for row in rows {
                    if let Some(key) = row.get(&dim.primary_key).and_then(value_to_key) {
                        keys.insert(key);
                    }
                }
            }
            snapshot.insert(&dim.name, keys);
        }

        Ok(self.gate.evaluate(
            &self.catalog,
            &rows_by_entity,
            &snapshot,
            run.process_date,
            run.id,
            Utc::now(),
        ))
    }

    /// Runs the warehouse load: the staging job through the executor,
    /// then the merge engine promotion of staged rows.
    async fn run_warehouse_load(
        &self,
        run: &mut PipelineRun,
        failure: &mut Option<PipelineError>,
    ) -> RunEvent {
        let stage = StageKind::CuratedToWarehouse;
        let Some(request) = self.stage_request(stage, run.process_date) else {
            return RunEvent::StageSucceeded;
        };

        let result = StageResult::started(stage);
        self.persist_stage(run.id, &result).await;
        info!(
            run_id = %run.id,
            stage = %stage,
            job = %request.job_name,
            "Dispatching warehouse staging job"
        );

        let timer = Instant::now();
        let (response, attempts) = match self.execute_with_retry(&request, stage).await {
            Ok(ok) => ok,
            Err((err, attempts)) => {
                let result = result.fail(attempts, err.to_string());
                self.metrics
                    .record_stage(&stage.to_string(), "failed", timer.elapsed().as_secs_f64());
                error!(run_id = %run.id, stage = %stage, attempts, "Staging job failed: {err}");
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
                failure.get_or_insert(err);
                return RunEvent::StageFailed;
            }
        };

        match self.merge_with_retry(run.process_date).await {
            Ok(outcomes) => {
                let inserted: u64 = outcomes.iter().map(|o| o.rows_inserted).sum();
                for outcome in &outcomes {
                    self.metrics.record_merge(
                        &outcome.table,
                        outcome.rows_deleted,
                        outcome.rows_inserted,
                    );
                    info!(
                        run_id = %run.id,
                        table = %outcome.table,
                        strategy = %outcome.strategy,
                        deleted = outcome.rows_deleted,
                        inserted = outcome.rows_inserted,
                        "Merge applied"
                    );
                }

                let result = result.succeed(response.records_out, inserted, attempts);
                self.metrics.record_stage(
                    &stage.to_string(),
                    "succeeded",
                    timer.elapsed().as_secs_f64(),
                );
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
                RunEvent::StageSucceeded
            }
            Err(e) => {
                let result = result.fail(attempts, e.to_string());
                self.metrics
                    .record_stage(&stage.to_string(), "failed", timer.elapsed().as_secs_f64());
                error!(run_id = %run.id, "Warehouse merge failed: {e}");
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
                failure.get_or_insert(PipelineError::Merge(e));
                RunEvent::StageFailed
            }
        }
    }

    /// Merges all entities for the date, retrying transient store errors.
    /// The merge is delete-then-insert per key set or month, so a retry
    /// replays it without side effects beyond the final state.
    async fn merge_with_retry(
        &self,
        process_date: NaiveDate,
    ) -> Result<Vec<MergeOutcome>, MergeError> {
        let _serialized = self.merge_lock.lock().await;
        let base_ms = self.config.backoff_base.as_millis() as u64;
        let cap_ms = self.config.backoff_cap.as_millis() as u64;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.merge.merge_all(&self.catalog, process_date).await {
                Ok(outcomes) => return Ok(outcomes),
                Err(e) if e.kind().is_retryable() && attempt < self.config.max_attempts => {
                    let delay = backoff_delay_jittered(
                        attempt,
                        base_ms,
                        cap_ms,
                        self.config.jitter_fraction,
                    );
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Merge attempt failed, retrying: {e}"
                    );
                    self.metrics
                        .record_retry(&StageKind::CuratedToWarehouse.to_string());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Isolates failing partitions through the quarantine sink.
    ///
    /// A sink failure is escalated by the sink itself and recorded on the
    /// run, but the run still terminates quarantined: the data did fail
    /// the gate, and that verdict must not be masked by a broken copy.
    async fn run_quarantine(
        &self,
        run: &mut PipelineRun,
        report: Option<&QualityReport>,
        failure: &mut Option<PipelineError>,
    ) -> RunEvent {
        let result = StageResult::started(StageKind::Quarantine);
        self.persist_stage(run.id, &result).await;

        let Some(report) = report else {
            // The gate always produces a report before this state.
            let result = result.fail(1, "no quality report available for quarantine");
            self.persist_stage(run.id, &result).await;
            run.push_stage(result);
            return RunEvent::QuarantineComplete;
        };

        match self.sink.quarantine_failures(report).await {
            Ok(records) => {
                for record in &records {
                    self.metrics.record_quarantine(&record.entity);
                    self.metrics.record_alert(&Severity::Warning.to_string());
                }
                info!(
                    run_id = %run.id,
                    partitions = records.len(),
                    "Failing partitions quarantined"
                );
                let count = records.len() as u64;
                let result = result.succeed(count, count, 1);
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
            }
            Err(e) => {
                // The sink already escalated with a critical alert.
                let result = result.fail(1, e.to_string());
                self.metrics.record_alert(&Severity::Critical.to_string());
                error!(run_id = %run.id, "Quarantine incomplete: {e}");
                self.persist_stage(run.id, &result).await;
                run.push_stage(result);
                failure.get_or_insert(e.into());
            }
        }

        RunEvent::QuarantineComplete
    }

    /// Emits the terminal notification for the run.
    ///
    /// A failed run produces exactly one critical alert carrying the error
    /// kind and detail. A quarantined run already alerted per failing
    /// partition from the sink, so only a summary is logged here. Alert
    /// delivery failures are logged and never fail the run.
    async fn notify(
        &self,
        run: &mut PipelineRun,
        outcome: RunOutcome,
        failure: Option<&PipelineError>,
        report: Option<&QualityReport>,
    ) -> RunEvent {
        let result = StageResult::started(StageKind::Notify);

        match outcome {
            RunOutcome::Succeeded => {
                let merged = run
                    .stage(StageKind::CuratedToWarehouse)
                    .map_or(0, |s| s.records_out);
                let alert = Alert::new(
                    Severity::Info,
                    &run.entity_group,
                    run.process_date,
                    run.id,
                    format!("Pipeline run completed: {merged} row(s) merged into the warehouse"),
                );
                self.send_alert(&alert).await;
            }
            RunOutcome::Failed => {
                let (kind, detail) = match failure {
                    Some(e) => (e.kind(), e.to_string()),
                    None => (
                        ErrorKind::Transient,
                        "run failed without recorded error".to_string(),
                    ),
                };
                let alert = Alert::new(
                    Severity::Critical,
                    &run.entity_group,
                    run.process_date,
                    run.id,
                    format!("Pipeline run failed ({kind}): {detail}"),
                );
                self.send_alert(&alert).await;
            }
            RunOutcome::Quarantined => {
                let failing = report.map_or(0, |r| r.failing_entities().len());
                info!(
                    run_id = %run.id,
                    failing_partitions = failing,
                    "Run quarantined; partition alerts already emitted"
                );
            }
        }

        let result = result.succeed(0, 0, 1);
        self.persist_stage(run.id, &result).await;
        run.push_stage(result);
        RunEvent::Notified
    }

    async fn send_alert(&self, alert: &Alert) {
        self.metrics.record_alert(&alert.severity.to_string());
        if let Err(e) = self.alerts.send(alert).await {
            warn!(severity = %alert.severity, "Alert delivery failed: {e}");
        }
    }

    /// Records a stage result without letting history writes fail the run.
    async fn persist_stage(&self, run_id: Uuid, result: &StageResult) {
        if let Err(e) = self.store.record_stage(run_id, result).await {
            warn!(run_id = %run_id, stage = %result.stage, "Failed to persist stage result: {e}");
        }
    }

    /// Persists the terminal status and frees the lease. The lease must
    /// come free even when the status write fails.
    async fn finalize_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let finished = self
            .store
            .finish_run(run.id, run.status, run.error.as_deref())
            .await;
        let released = self
            .store
            .release_lease(&run.entity_group, run.process_date)
            .await;

        if let Err(e) = &finished {
            error!(run_id = %run.id, "Failed to persist terminal status: {e}");
        }
        finished?;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ProcessDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn test_orchestrator(config: PipelineConfig) -> Orchestrator {
        let lake = Arc::new(LakeStore::from_config(&config));
        Orchestrator::new(
            config,
            EntityCatalog::example(),
            Arc::new(crate::storage::MemoryRunStore::new()),
            Arc::new(NeverExecutor),
            Arc::new(crate::warehouse::MemoryWarehouse::new()),
            lake,
            Arc::new(crate::alert::LogAlertSink),
        )
    }

    struct NeverExecutor;

    #[async_trait::async_trait]
    impl StageExecutor for NeverExecutor {
        async fn execute(
            &self,
            _request: &StageRequest,
        ) -> Result<StageResponse, crate::stage::ExecutorError> {
            Err(crate::stage::ExecutorError::Transport(
                "no executor in this test".to_string(),
            ))
        }
    }

    #[test]
    fn test_cancel_handle_flips_once_set() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());

        let shared = handle.clone();
        shared.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_stage_request_maps_layer_roots() {
        let config = PipelineConfig::default()
            .with_environment("dev")
            .with_lake_root("/lake");
        let orch = test_orchestrator(config);
        let day = date(2024, 1, 15);

        let raw = orch
            .stage_request(StageKind::RawToClean, day)
            .expect("raw_to_clean is executor-backed");
        assert_eq!(raw.job_name, "c360-raw-to-clean-dev");
        assert_eq!(raw.partition_key, "2024-01-15");
        assert!(raw.source_location.starts_with("/lake/raw"));
        assert!(raw.target_location.starts_with("/lake/clean"));

        let load = orch
            .stage_request(StageKind::CuratedToWarehouse, day)
            .expect("warehouse load is executor-backed");
        assert!(load.source_location.starts_with("/lake/curated"));

        assert!(orch.stage_request(StageKind::QualityGate, day).is_none());
        assert!(orch.stage_request(StageKind::Notify, day).is_none());
    }

    #[test]
    fn test_pipeline_error_kind_classification() {
        let stage_err = PipelineError::StageFailed {
            stage: StageKind::RawToClean,
            attempts: 3,
            message: "boom".to_string(),
            kind: ErrorKind::Transient,
        };
        assert_eq!(stage_err.kind(), ErrorKind::Transient);

        let lease = PipelineError::Store(StoreError::LeaseHeld {
            entity_group: "customer360".to_string(),
            process_date: date(2024, 1, 15),
        });
        assert_eq!(lease.kind(), ErrorKind::AlreadyRunning);

        let cancelled = PipelineError::Cancelled("raw_to_clean".to_string());
        assert_eq!(cancelled.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_second_start_for_same_date_is_rejected() {
        let config = PipelineConfig::default().with_environment("test");
        let orch = test_orchestrator(config);
        let trigger = RunTrigger::new(ProcessDate::On(date(2024, 1, 15)));

        let first = orch.start(&trigger).await.expect("first start acquires lease");

        let second = orch.start(&trigger).await;
        match second {
            Err(PipelineError::Store(StoreError::LeaseHeld { .. })) => {}
            other => panic!("expected LeaseHeld, got {:?}", other.map(|r| r.id)),
        }

        // The losing trigger must not leave a run record behind.
        let runs = orch
            .store
            .list_runs(&crate::storage::RunFilter::new())
            .await
            .expect("list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, first.id);
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_before_any_stage_dispatch() {
        let config = PipelineConfig::default().with_environment("test");
        let orch = test_orchestrator(config);
        orch.cancel_handle().cancel();

        let trigger = RunTrigger::new(ProcessDate::On(date(2024, 1, 15)));
        let run = orch.start(&trigger).await.expect("start");
        let run = orch.execute(run).await.expect("lifecycle completes");

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap_or("").contains("cancelled"));
        // No transform job was dispatched before the boundary check.
        assert!(run.stage(StageKind::IngestCheck).is_none());

        let runs = orch
            .store
            .list_runs(&crate::storage::RunFilter::new())
            .await
            .expect("list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);

        // The lease came free with the terminal state, so the date can be
        // triggered again.
        let again = orch.start(&trigger).await.expect("lease released");
        assert_ne!(again.id, runs[0].id);
    }
}
