//! Control-plane schema and SQL constants.
//!
//! These tables record runs, their stage results, lease ownership, and
//! quarantined partitions. Warehouse tables are created separately from
//! the entity catalog; nothing here describes warehouse data.

/// SQL schema for the pipeline_runs table.
pub const CREATE_PIPELINE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id UUID PRIMARY KEY,
    entity_group VARCHAR(255) NOT NULL,
    process_date DATE NOT NULL,
    environment VARCHAR(100) NOT NULL,
    triggered_by VARCHAR(100) NOT NULL,
    status VARCHAR(20) NOT NULL,
    error TEXT,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finished_at TIMESTAMPTZ
)
"#;

/// SQL schema for the stage_results table.
pub const CREATE_STAGE_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stage_results (
    id SERIAL PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    stage VARCHAR(50) NOT NULL,
    status VARCHAR(20) NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    records_in BIGINT NOT NULL DEFAULT 0,
    records_out BIGINT NOT NULL DEFAULT 0,
    error TEXT,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    UNIQUE(run_id, stage)
)
"#;

/// SQL schema for the pipeline_leases table.
///
/// The composite primary key is the concurrency guard: inserting a lease
/// for a (group, date) pair that is already held affects zero rows, and
/// the caller turns that into an already-running error.
pub const CREATE_PIPELINE_LEASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_leases (
    entity_group VARCHAR(255) NOT NULL,
    process_date DATE NOT NULL,
    run_id UUID NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (entity_group, process_date)
)
"#;

/// SQL schema for the quarantine_records table.
pub const CREATE_QUARANTINE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS quarantine_records (
    id SERIAL PRIMARY KEY,
    run_id UUID NOT NULL,
    entity VARCHAR(255) NOT NULL,
    process_date DATE NOT NULL,
    location VARCHAR(1024) NOT NULL,
    failing_checks JSONB NOT NULL,
    quarantined_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Index creation statements, one statement per constant so each runs as
/// its own prepared query.
pub const CREATE_INDEX_RUNS_GROUP_DATE: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_group_date
    ON pipeline_runs(entity_group, process_date)
"#;

pub const CREATE_INDEX_RUNS_STATUS: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status)
"#;

pub const CREATE_INDEX_STAGE_RESULTS_RUN: &str = r#"
CREATE INDEX IF NOT EXISTS idx_stage_results_run_id ON stage_results(run_id)
"#;

pub const CREATE_INDEX_QUARANTINE_ENTITY_DATE: &str = r#"
CREATE INDEX IF NOT EXISTS idx_quarantine_records_entity_date
    ON quarantine_records(entity, process_date)
"#;

/// The ordered migration set: `(name, statement)` pairs applied once each
/// and remembered by name in the migration ledger.
///
/// Order matters twice over: `stage_results` references `pipeline_runs`,
/// and indexes follow their tables.
pub fn migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        ("create_pipeline_runs", CREATE_PIPELINE_RUNS_TABLE),
        ("create_stage_results", CREATE_STAGE_RESULTS_TABLE),
        ("create_pipeline_leases", CREATE_PIPELINE_LEASES_TABLE),
        ("create_quarantine_records", CREATE_QUARANTINE_RECORDS_TABLE),
        ("idx_runs_group_date", CREATE_INDEX_RUNS_GROUP_DATE),
        ("idx_runs_status", CREATE_INDEX_RUNS_STATUS),
        ("idx_stage_results_run", CREATE_INDEX_STAGE_RESULTS_RUN),
        ("idx_quarantine_entity_date", CREATE_INDEX_QUARANTINE_ENTITY_DATE),
    ]
}
