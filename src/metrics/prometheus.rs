//! Prometheus registry, metric definitions, and text export.
//!
//! Metrics live in process-wide statics so the recording facade can reach
//! them from anywhere in the pipeline without threading a handle through
//! every call site.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use tracing::debug;

/// Global registry holding every lakegate metric.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Runs finished, labeled by terminal status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// End-to-end run duration in seconds.
pub static RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Stage executions, labeled by stage and status.
pub static STAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Stage retries beyond the first attempt, labeled by stage.
pub static STAGE_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Quality gate check evaluations, labeled by check and status.
pub static GATE_CHECKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Partitions quarantined, labeled by entity.
pub static QUARANTINED_PARTITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Warehouse rows touched by merges, labeled by table and operation.
pub static ROWS_MERGED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Alerts emitted, labeled by severity.
pub static ALERTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Runs currently holding a lease.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Builds and registers every metric. Call once at startup; repeated calls
/// leave the first registry in place and return `Ok`.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("lakegate_runs_total", "Runs finished by terminal status"),
        &["status"],
    )?;
    let run_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "lakegate_run_duration_seconds",
            "End-to-end run duration in seconds",
        )
        .buckets(vec![30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
    )?;
    let stages_total = CounterVec::new(
        Opts::new("lakegate_stages_total", "Stage executions by stage and status"),
        &["stage", "status"],
    )?;
    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "lakegate_stage_duration_seconds",
            "Stage duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
        &["stage"],
    )?;
    let stage_retries_total = CounterVec::new(
        Opts::new(
            "lakegate_stage_retries_total",
            "Stage retries beyond the first attempt",
        ),
        &["stage"],
    )?;
    let gate_checks_total = CounterVec::new(
        Opts::new(
            "lakegate_gate_checks_total",
            "Quality gate check evaluations by check and status",
        ),
        &["check", "status"],
    )?;
    let quarantined_partitions_total = CounterVec::new(
        Opts::new(
            "lakegate_quarantined_partitions_total",
            "Partitions quarantined by entity",
        ),
        &["entity"],
    )?;
    let rows_merged_total = CounterVec::new(
        Opts::new(
            "lakegate_rows_merged_total",
            "Warehouse rows touched by merges, by table and operation",
        ),
        &["table", "op"],
    )?;
    let alerts_total = CounterVec::new(
        Opts::new("lakegate_alerts_total", "Alerts emitted by severity"),
        &["severity"],
    )?;
    let active_runs = Gauge::new("lakegate_active_runs", "Runs currently holding a lease")?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(stages_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(stage_retries_total.clone()))?;
    registry.register(Box::new(gate_checks_total.clone()))?;
    registry.register(Box::new(quarantined_partitions_total.clone()))?;
    registry.register(Box::new(rows_merged_total.clone()))?;
    registry.register(Box::new(alerts_total.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;

    // set() fails only when already initialized, which is fine.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = STAGES_TOTAL.set(stages_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = STAGE_RETRIES_TOTAL.set(stage_retries_total);
    let _ = GATE_CHECKS_TOTAL.set(gate_checks_total);
    let _ = QUARANTINED_PARTITIONS_TOTAL.set(quarantined_partitions_total);
    let _ = ROWS_MERGED_TOTAL.set(rows_merged_total);
    let _ = ALERTS_TOTAL.set(alerts_total);
    let _ = ACTIVE_RUNS.set(active_runs);

    debug!("Metrics registry initialized");
    Ok(())
}

/// Renders every registered metric in the Prometheus text exposition
/// format. Before `init_metrics` has run, or on an encoding problem, the
/// output is a comment line instead of metric samples.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# metrics registry not initialized\n".to_string();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return format!("# metrics encoding failed: {e}\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| format!("# metrics not valid UTF-8: {e}\n"))
}
