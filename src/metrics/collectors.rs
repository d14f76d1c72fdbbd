//! Recording facade over the registered metrics.
//!
//! The orchestrator records through [`MetricsCollector`] instead of
//! touching the Prometheus statics directly. Every method is a no-op
//! until `init_metrics()` has run, so library users who skip metrics
//! setup pay nothing.

use tracing::trace;

use super::prometheus::{
    ACTIVE_RUNS, ALERTS_TOTAL, GATE_CHECKS_TOTAL, QUARANTINED_PARTITIONS_TOTAL, ROWS_MERGED_TOTAL,
    RUNS_TOTAL, RUN_DURATION, STAGES_TOTAL, STAGE_DURATION, STAGE_RETRIES_TOTAL,
};

/// Records pipeline events against the process-wide metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a finished run with its terminal status and duration.
    pub fn record_run(&self, status: &str, duration_secs: f64) {
        if let Some(runs_total) = RUNS_TOTAL.get() {
            runs_total.with_label_values(&[status]).inc();
        }
        if let Some(run_duration) = RUN_DURATION.get() {
            run_duration.observe(duration_secs);
        }
        trace!(status, duration_secs, "Recorded run metric");
    }

    /// Records one stage execution outcome.
    pub fn record_stage(&self, stage: &str, status: &str, duration_secs: f64) {
        if let Some(stages_total) = STAGES_TOTAL.get() {
            stages_total.with_label_values(&[stage, status]).inc();
        }
        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[stage])
                .observe(duration_secs);
        }
        trace!(stage, status, duration_secs, "Recorded stage metric");
    }

    /// Records one retry, an attempt beyond a stage's first.
    pub fn record_retry(&self, stage: &str) {
        if let Some(retries) = STAGE_RETRIES_TOTAL.get() {
            retries.with_label_values(&[stage]).inc();
        }
        trace!(stage, "Recorded stage retry metric");
    }

    /// Records a quality gate check evaluation and its verdict.
    pub fn record_gate_check(&self, check: &str, status: &str) {
        if let Some(gate_checks) = GATE_CHECKS_TOTAL.get() {
            gate_checks.with_label_values(&[check, status]).inc();
        }
        trace!(check, status, "Recorded gate check metric");
    }

    /// Records one quarantined partition.
    pub fn record_quarantine(&self, entity: &str) {
        if let Some(quarantined) = QUARANTINED_PARTITIONS_TOTAL.get() {
            quarantined.with_label_values(&[entity]).inc();
        }
        trace!(entity, "Recorded quarantine metric");
    }

    /// Records the rows a merge deleted and inserted for one table.
    pub fn record_merge(&self, table: &str, deleted: u64, inserted: u64) {
        if let Some(rows_merged) = ROWS_MERGED_TOTAL.get() {
            rows_merged
                .with_label_values(&[table, "deleted"])
                .inc_by(deleted as f64);
            rows_merged
                .with_label_values(&[table, "inserted"])
                .inc_by(inserted as f64);
        }
        trace!(table, deleted, inserted, "Recorded merge metric");
    }

    /// Records one emitted alert.
    pub fn record_alert(&self, severity: &str) {
        if let Some(alerts) = ALERTS_TOTAL.get() {
            alerts.with_label_values(&[severity]).inc();
        }
        trace!(severity, "Recorded alert metric");
    }

    /// Bumps the count of runs holding a lease.
    pub fn inc_active_runs(&self) {
        if let Some(active_runs) = ACTIVE_RUNS.get() {
            active_runs.inc();
        }
    }

    /// Drops the count of runs holding a lease.
    pub fn dec_active_runs(&self) {
        if let Some(active_runs) = ACTIVE_RUNS.get() {
            active_runs.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    // Recording must hold up with or without an initialized registry, so
    // these tests assert by surviving the calls in both orders.
    #[test]
    fn test_recording_before_init_is_harmless() {
        let collector = MetricsCollector::new();
        collector.record_run("succeeded", 12.0);
        collector.record_retry("raw_to_clean");
        collector.inc_active_runs();
        collector.dec_active_runs();
    }

    #[test]
    fn test_run_and_stage_recording() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_run("succeeded", 512.3);
        collector.record_run("failed", 210.0);
        collector.record_run("quarantined", 420.0);
        collector.record_stage("ingest_check", "succeeded", 2.0);
        collector.record_stage("raw_to_clean", "failed", 61.0);
        collector.record_retry("raw_to_clean");
    }

    #[test]
    fn test_gate_merge_and_alert_recording() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_gate_check("null_rate", "pass");
        collector.record_gate_check("duplicate_rate", "fail");
        collector.record_quarantine("transactions");
        collector.record_merge("dim_customer", 5, 100);
        collector.record_alert("warning");
        collector.inc_active_runs();
        collector.dec_active_runs();
    }
}
