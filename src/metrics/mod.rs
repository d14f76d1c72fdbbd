//! Prometheus metrics for pipeline operations.
//!
//! Covers run outcomes and durations, stage executions and retries, gate
//! check verdicts, quarantined partitions, warehouse merge volumes, and
//! emitted alerts. `init_metrics()` registers everything once at startup;
//! [`MetricsCollector`] is the recording facade the orchestrator uses.

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_RUNS, ALERTS_TOTAL, GATE_CHECKS_TOTAL, QUARANTINED_PARTITIONS_TOTAL, REGISTRY,
    ROWS_MERGED_TOTAL, RUNS_TOTAL, RUN_DURATION, STAGES_TOTAL, STAGE_DURATION,
    STAGE_RETRIES_TOTAL,
};
