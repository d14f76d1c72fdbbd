//! The quality gate.
//!
//! Evaluation is a pure function from curated rows, catalog schemas, and a
//! dimension snapshot to a [`QualityReport`]. All IO happens before the
//! gate runs, so the same inputs always produce the same verdict and the
//! gate can be exercised in tests without a lake or a warehouse.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::catalog::{EntityCatalog, EntityConfig};
use crate::config::PipelineConfig;
use crate::lake::Record;

use super::checks;
use super::checks::DimensionSnapshot;
use super::report::{EntityReport, QualityReport};

/// Default null-rate threshold for required fields.
const DEFAULT_MAX_NULL_RATE: f64 = 0.05;

/// Default duplicate-rate threshold for fact primary keys. Dimension keys
/// are hard-unique and default to zero tolerance.
const DEFAULT_MAX_DUPLICATE_RATE: f64 = 0.01;

/// Default row count floor.
const DEFAULT_MIN_ROW_COUNT: u64 = 100;

/// Default staleness window.
const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(6 * 3600);

/// Default bound on offending-key samples per check.
const DEFAULT_SAMPLE_LIMIT: usize = 10;

/// Threshold configuration for gate evaluation.
///
/// Per-entity overrides in the catalog take precedence over these
/// defaults; the gate resolves them at evaluation time.
pub struct QualityGate {
    max_null_rate: f64,
    max_duplicate_rate: f64,
    min_row_count: u64,
    staleness_window: Duration,
    sample_limit: usize,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            max_null_rate: DEFAULT_MAX_NULL_RATE,
            max_duplicate_rate: DEFAULT_MAX_DUPLICATE_RATE,
            min_row_count: DEFAULT_MIN_ROW_COUNT,
            staleness_window: DEFAULT_STALENESS_WINDOW,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }
}

impl QualityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gate using the configured thresholds.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_null_rate: config.max_null_rate,
            max_duplicate_rate: config.max_duplicate_rate,
            min_row_count: config.min_row_count,
            staleness_window: config.staleness_window,
            sample_limit: config.sample_limit,
        }
    }

    pub fn with_max_null_rate(mut self, rate: f64) -> Self {
        self.max_null_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_duplicate_rate(mut self, rate: f64) -> Self {
        self.max_duplicate_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_row_count(mut self, count: u64) -> Self {
        self.min_row_count = count;
        self
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    /// Evaluates every entity of the catalog in declaration order.
    ///
    /// `rows_by_entity` holds the parsed curated partition per entity and
    /// `snapshot` the warehouse dimension keys captured before evaluation.
    pub fn evaluate(
        &self,
        catalog: &EntityCatalog,
        rows_by_entity: &HashMap<String, Vec<Record>>,
        snapshot: &DimensionSnapshot,
        process_date: chrono::NaiveDate,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> QualityReport {
        let mut report = QualityReport::new(&catalog.group, process_date, run_id, now);

        for entity in &catalog.entities {
            let rows = rows_by_entity
                .get(&entity.name)
                .map(|r| r.as_slice())
                .unwrap_or(&[]);
            report.push(self.evaluate_entity(entity, rows, snapshot, now));
        }

        report
    }

    /// Runs all checks over one entity's partition.
    pub fn evaluate_entity(
        &self,
        entity: &EntityConfig,
        rows: &[Record],
        snapshot: &DimensionSnapshot,
        now: DateTime<Utc>,
    ) -> EntityReport {
        let null_rate = entity.max_null_rate.unwrap_or(self.max_null_rate);
        let duplicate_rate = entity.max_duplicate_rate.unwrap_or(if entity.is_dimension() {
            // Dimension keys become warehouse natural keys; a duplicate is
            // never acceptable unless the catalog says otherwise.
            0.0
        } else {
            self.max_duplicate_rate
        });
        let min_rows = entity.min_row_count.unwrap_or(self.min_row_count);

        let mut report = EntityReport::new(&entity.name, rows.len() as u64);

        report.push(checks::check_schema(entity, rows, self.sample_limit));
        report.push(checks::check_null_rate(
            entity,
            rows,
            null_rate,
            self.sample_limit,
        ));
        report.push(checks::check_duplicates(
            entity,
            rows,
            duplicate_rate,
            self.sample_limit,
        ));

        if !entity.references.is_empty() {
            report.push(checks::check_references(
                entity,
                rows,
                snapshot,
                self.sample_limit,
            ));
        }

        if let Some(result) = checks::check_freshness(entity, rows, now, self.staleness_window) {
            report.push(result);
        }

        report.push(checks::check_row_count(rows, min_rows));

        if let Some(result) = checks::check_ranges(entity, rows, self.sample_limit) {
            report.push(result);
        }

        report
    }
}
