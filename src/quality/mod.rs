//! Quality gate for curated partitions.
//!
//! This module decides whether a day of curated data is fit for warehouse
//! promotion. Checks cover schema conformance, null and duplicate rates,
//! referential integrity against warehouse dimensions, freshness, and
//! declared value constraints. A failing verdict routes the run to
//! quarantine instead of the merge stage.

mod checks;
mod gate;
mod report;

pub use checks::{
    check_duplicates, check_freshness, check_null_rate, check_ranges, check_references,
    check_row_count, check_schema, DimensionSnapshot,
};
pub use gate::QualityGate;
pub use report::{CheckKind, CheckResult, CheckStatus, EntityReport, QualityReport};
