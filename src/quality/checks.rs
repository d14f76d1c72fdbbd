//! Individual quality checks.
//!
//! Each check is a pure function over the parsed rows of one curated
//! partition. Checks never read the lake or the warehouse themselves;
//! the gate hands them everything they need, which keeps them trivially
//! testable and keeps gate evaluation free of side effects.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::catalog::{parse_timestamp_value, value_to_key, EntityConfig};
use crate::lake::Record;

use super::report::{CheckKind, CheckResult};

/// Natural keys currently present in the warehouse dimensions, captured
/// once before gate evaluation. Referential checks compare fact foreign
/// keys against this snapshot rather than live tables so a single run
/// sees one consistent view.
#[derive(Debug, Clone, Default)]
pub struct DimensionSnapshot {
    keys: HashMap<String, HashSet<String>>,
}

impl DimensionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the key set recorded for a dimension entity.
    pub fn insert(&mut self, entity: impl Into<String>, keys: HashSet<String>) {
        self.keys.insert(entity.into(), keys);
    }

    /// Adds a single key to a dimension entity's set.
    pub fn add_key(&mut self, entity: &str, key: impl Into<String>) {
        self.keys
            .entry(entity.to_string())
            .or_default()
            .insert(key.into());
    }

    pub fn contains(&self, entity: &str, key: &str) -> bool {
        self.keys
            .get(entity)
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    pub fn key_count(&self, entity: &str) -> usize {
        self.keys.get(entity).map(|set| set.len()).unwrap_or(0)
    }
}

/// Identifier used for a row in check samples: the primary key when the
/// row has one, the row position otherwise.
fn row_label(entity: &EntityConfig, row: &Record, index: usize) -> String {
    row.get(&entity.primary_key)
        .and_then(value_to_key)
        .unwrap_or_else(|| format!("row {}", index))
}

/// Schema conformance: every required field present, every non-null value
/// coercible to its declared type. Missing keys are schema violations;
/// explicit nulls are left to the null-rate check.
pub fn check_schema(entity: &EntityConfig, rows: &[Record], sample_limit: usize) -> CheckResult {
    let mut violations = 0u64;
    let mut samples = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        let mut problem: Option<String> = None;

        for field in &entity.fields {
            match row.get(&field.name) {
                None if field.required => {
                    problem = Some(format!("missing field '{}'", field.name));
                    break;
                }
                None => {}
                Some(serde_json::Value::Null) => {}
                Some(value) if !field.field_type.coercible(value) => {
                    problem = Some(format!(
                        "field '{}' is not a valid {}",
                        field.name, field.field_type
                    ));
                    break;
                }
                Some(_) => {}
            }
        }

        if let Some(problem) = problem {
            violations += 1;
            if samples.len() < sample_limit {
                samples.push(format!("{}: {}", row_label(entity, row, index), problem));
            }
        }
    }

    let rate = rate_of(violations, rows.len());
    if violations > 0 {
        CheckResult::fail(
            CheckKind::Schema,
            format!("{} of {} rows violate the declared schema", violations, rows.len()),
        )
        .with_observed(rate, 0.0)
        .with_samples(samples)
    } else {
        CheckResult::pass(CheckKind::Schema, "all rows conform to the declared schema")
            .with_observed(0.0, 0.0)
    }
}

/// Null rate over required fields. A field's rate is the share of rows
/// carrying an explicit null; the check reports the worst field.
pub fn check_null_rate(
    entity: &EntityConfig,
    rows: &[Record],
    max_rate: f64,
    sample_limit: usize,
) -> CheckResult {
    if rows.is_empty() {
        return CheckResult::pass(CheckKind::NullRate, "no rows to check")
            .with_observed(0.0, max_rate);
    }

    let mut worst_field: Option<&str> = None;
    let mut worst_rate = 0.0f64;
    let mut worst_samples = Vec::new();

    for field in entity.fields.iter().filter(|f| f.required) {
        let mut nulls = 0u64;
        let mut samples = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            if matches!(row.get(&field.name), Some(serde_json::Value::Null)) {
                nulls += 1;
                if samples.len() < sample_limit {
                    samples.push(row_label(entity, row, index));
                }
            }
        }

        let rate = rate_of(nulls, rows.len());
        if rate > worst_rate {
            worst_rate = rate;
            worst_field = Some(&field.name);
            worst_samples = samples;
        }
    }

    match worst_field {
        Some(field) if worst_rate > max_rate => CheckResult::fail(
            CheckKind::NullRate,
            format!(
                "null rate {:.4} on field '{}' exceeds threshold {:.4}",
                worst_rate, field, max_rate
            ),
        )
        .with_observed(worst_rate, max_rate)
        .with_samples(worst_samples),
        _ => CheckResult::pass(CheckKind::NullRate, "null rates within threshold")
            .with_observed(worst_rate, max_rate),
    }
}

/// Duplicate rate over the primary key. Rows with no usable key are
/// skipped here; the schema check already flags them.
pub fn check_duplicates(
    entity: &EntityConfig,
    rows: &[Record],
    max_rate: f64,
    sample_limit: usize,
) -> CheckResult {
    let mut seen: HashMap<String, u64> = HashMap::new();
    let mut keyed_rows = 0u64;

    for row in rows {
        if let Some(key) = row.get(&entity.primary_key).and_then(value_to_key) {
            keyed_rows += 1;
            *seen.entry(key).or_insert(0) += 1;
        }
    }

    let duplicates: u64 = seen.values().filter(|&&n| n > 1).map(|&n| n - 1).sum();
    let rate = rate_of(duplicates, keyed_rows as usize);

    if rate > max_rate {
        let mut samples: Vec<String> = seen
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(key, _)| key.clone())
            .collect();
        samples.sort();
        samples.truncate(sample_limit);

        CheckResult::fail(
            CheckKind::DuplicateRate,
            format!(
                "duplicate rate {:.4} on key '{}' exceeds threshold {:.4}",
                rate, entity.primary_key, max_rate
            ),
        )
        .with_observed(rate, max_rate)
        .with_samples(samples)
    } else {
        CheckResult::pass(CheckKind::DuplicateRate, "duplicate rate within threshold")
            .with_observed(rate, max_rate)
    }
}

/// Referential integrity: every non-null foreign key must exist in the
/// dimension snapshot. Any violation fails the check.
pub fn check_references(
    entity: &EntityConfig,
    rows: &[Record],
    snapshot: &DimensionSnapshot,
    sample_limit: usize,
) -> CheckResult {
    if entity.references.is_empty() {
        return CheckResult::pass(CheckKind::ReferentialIntegrity, "no references declared");
    }

    let mut violations = 0u64;
    let mut samples = Vec::new();

    for row in rows.iter() {
        for reference in &entity.references {
            let Some(key) = row.get(&reference.field).and_then(value_to_key) else {
                continue;
            };

            if !snapshot.contains(&reference.entity, &key) {
                violations += 1;
                if samples.len() < sample_limit {
                    samples.push(format!("{}={}", reference.field, key));
                }
                break;
            }
        }
    }

    let rate = rate_of(violations, rows.len());
    if violations > 0 {
        CheckResult::fail(
            CheckKind::ReferentialIntegrity,
            format!(
                "{} of {} rows reference keys missing from dimensions",
                violations,
                rows.len()
            ),
        )
        .with_observed(rate, 0.0)
        .with_samples(samples)
    } else {
        CheckResult::pass(
            CheckKind::ReferentialIntegrity,
            "all references resolve against dimension snapshot",
        )
        .with_observed(0.0, 0.0)
    }
}

/// Freshness: the newest value of the declared freshness column must fall
/// within the staleness window. Returns `None` when the entity declares
/// no freshness column.
pub fn check_freshness(
    entity: &EntityConfig,
    rows: &[Record],
    now: DateTime<Utc>,
    staleness_window: Duration,
) -> Option<CheckResult> {
    let column = entity.freshness_column.as_deref()?;

    if rows.is_empty() {
        return Some(
            CheckResult::pass(CheckKind::Freshness, "no rows to check")
                .with_observed(0.0, staleness_window.as_secs_f64()),
        );
    }

    let newest = rows
        .iter()
        .filter_map(|row| row.get(column))
        .filter_map(parse_timestamp_value)
        .max();

    let Some(newest) = newest else {
        return Some(CheckResult::fail(
            CheckKind::Freshness,
            format!("no parseable values in freshness column '{}'", column),
        ));
    };

    let age = now.signed_duration_since(newest);
    let age_secs = age.num_seconds().max(0) as f64;
    let window_secs = staleness_window.as_secs_f64();

    if age_secs > window_secs {
        Some(
            CheckResult::fail(
                CheckKind::Freshness,
                format!(
                    "newest '{}' value is {}s old, beyond the {}s staleness window",
                    column, age_secs as u64, window_secs as u64
                ),
            )
            .with_observed(age_secs, window_secs),
        )
    } else {
        Some(
            CheckResult::pass(CheckKind::Freshness, "data within staleness window")
                .with_observed(age_secs, window_secs),
        )
    }
}

/// Row count floor. An empty or thin partition may be legitimate quiet
/// traffic, so this warns rather than fails.
pub fn check_row_count(rows: &[Record], min_rows: u64) -> CheckResult {
    let count = rows.len() as u64;
    if count == 0 {
        CheckResult::warn(CheckKind::RowCount, "partition is empty")
            .with_observed(0.0, min_rows as f64)
    } else if count < min_rows {
        CheckResult::warn(
            CheckKind::RowCount,
            format!("row count {} below floor {}", count, min_rows),
        )
        .with_observed(count as f64, min_rows as f64)
    } else {
        CheckResult::pass(CheckKind::RowCount, "row count at or above floor")
            .with_observed(count as f64, min_rows as f64)
    }
}

/// Declared value constraints: regex patterns on strings and min/max
/// bounds on numerics. Returns `None` when no field declares any.
pub fn check_ranges(
    entity: &EntityConfig,
    rows: &[Record],
    sample_limit: usize,
) -> Option<CheckResult> {
    let constrained: Vec<_> = entity
        .fields
        .iter()
        .filter(|f| f.pattern.is_some() || f.min.is_some() || f.max.is_some())
        .collect();
    if constrained.is_empty() {
        return None;
    }

    // Catalog validation already rejected uncompilable patterns.
    let patterns: HashMap<&str, regex::Regex> = constrained
        .iter()
        .filter_map(|f| {
            let pattern = f.pattern.as_deref()?;
            regex::Regex::new(pattern)
                .ok()
                .map(|re| (f.name.as_str(), re))
        })
        .collect();

    let mut violations = 0u64;
    let mut samples = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        let mut problem: Option<String> = None;

        for field in &constrained {
            let Some(value) = row.get(&field.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }

            if let (Some(re), Some(s)) = (patterns.get(field.name.as_str()), value.as_str()) {
                if !re.is_match(s) {
                    problem = Some(format!("{}='{}' does not match pattern", field.name, s));
                    break;
                }
            }

            if let Some(n) = value.as_f64() {
                if field.min.map(|min| n < min).unwrap_or(false) {
                    problem = Some(format!("{}={} below minimum", field.name, n));
                    break;
                }
                if field.max.map(|max| n > max).unwrap_or(false) {
                    problem = Some(format!("{}={} above maximum", field.name, n));
                    break;
                }
            }
        }

        if let Some(problem) = problem {
            violations += 1;
            if samples.len() < sample_limit {
                samples.push(format!("{}: {}", row_label(entity, row, index), problem));
            }
        }
    }

    let rate = rate_of(violations, rows.len());
    Some(if violations > 0 {
        CheckResult::fail(
            CheckKind::ValueRange,
            format!(
                "{} of {} rows violate declared value constraints",
                violations,
                rows.len()
            ),
        )
        .with_observed(rate, 0.0)
        .with_samples(samples)
    } else {
        CheckResult::pass(CheckKind::ValueRange, "all values within declared constraints")
            .with_observed(0.0, 0.0)
    })
}

fn rate_of(count: u64, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::super::report::CheckStatus;
    use super::*;
    use crate::catalog::{EntityKind, FieldSchema, FieldType};
    use serde_json::json;

    fn customers() -> EntityConfig {
        EntityConfig::new("customers", EntityKind::Dimension, "customer_id", "dim_customer")
            .with_field(FieldSchema::required("customer_id", FieldType::String))
            .with_field(
                FieldSchema::required("email", FieldType::String)
                    .with_pattern("^[^@\\s]+@[^@\\s]+$"),
            )
            .with_field(FieldSchema::new("age", FieldType::Integer))
            .with_freshness_column("updated_at")
    }

    fn transactions() -> EntityConfig {
        EntityConfig::new("transactions", EntityKind::Fact, "transaction_id", "fact_sales")
            .with_date_key("transaction_date")
            .with_field(FieldSchema::required("transaction_id", FieldType::String))
            .with_field(FieldSchema::required("customer_id", FieldType::String))
            .with_field(FieldSchema::required("transaction_date", FieldType::Date))
            .with_field(FieldSchema::required("amount", FieldType::Float).with_min(0.0))
            .with_reference("customer_id", "customers")
    }

    fn customer_row(id: &str, email: &str) -> Record {
        let mut map = Record::new();
        map.insert("customer_id".to_string(), json!(id));
        map.insert("email".to_string(), json!(email));
        map.insert("updated_at".to_string(), json!("2024-01-15T10:00:00Z"));
        map
    }

    fn txn_row(id: &str, customer: &str, amount: f64) -> Record {
        let mut map = Record::new();
        map.insert("transaction_id".to_string(), json!(id));
        map.insert("customer_id".to_string(), json!(customer));
        map.insert("transaction_date".to_string(), json!("2024-01-15"));
        map.insert("amount".to_string(), json!(amount));
        map
    }

    #[test]
    fn test_schema_passes_conforming_rows() {
        let rows = vec![customer_row("C1", "c1@example.com")];
        let result = check_schema(&customers(), &rows, 10);
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[test]
    fn test_schema_fails_on_missing_required_field() {
        let mut row = customer_row("C1", "c1@example.com");
        row.remove("email");
        let result = check_schema(&customers(), &[row], 10);
        assert!(result.failed());
        assert!(result.samples[0].contains("missing field 'email'"));
        assert!(result.samples[0].contains("C1"));
    }

    #[test]
    fn test_schema_fails_on_type_mismatch() {
        let mut row = customer_row("C1", "c1@example.com");
        row.insert("age".to_string(), json!("not a number"));
        let result = check_schema(&customers(), &[row], 10);
        assert!(result.failed());
        assert!(result.message.contains("1 of 1"));
    }

    #[test]
    fn test_schema_leaves_explicit_nulls_to_null_rate() {
        let mut row = customer_row("C1", "c1@example.com");
        row.insert("email".to_string(), json!(null));
        let result = check_schema(&customers(), &[row], 10);
        assert!(!result.failed());
    }

    #[test]
    fn test_null_rate_fails_above_threshold() {
        let mut rows = vec![
            customer_row("C1", "c1@example.com"),
            customer_row("C2", "c2@example.com"),
        ];
        rows[1].insert("email".to_string(), json!(null));

        let result = check_null_rate(&customers(), &rows, 0.25, 10);
        assert!(result.failed());
        assert!((result.observed.unwrap() - 0.5).abs() < f64::EPSILON);
        assert_eq!(result.samples, vec!["C2"]);
    }

    #[test]
    fn test_null_rate_passes_at_threshold() {
        let mut rows = vec![
            customer_row("C1", "c1@example.com"),
            customer_row("C2", "c2@example.com"),
        ];
        rows[1].insert("email".to_string(), json!(null));

        // Exactly at the threshold is acceptable.
        let result = check_null_rate(&customers(), &rows, 0.5, 10);
        assert!(!result.failed());
    }

    #[test]
    fn test_duplicate_check_catches_repeated_key() {
        // One hundred rows, C100 appearing twice.
        let mut rows: Vec<Record> = (1..=99)
            .map(|i| customer_row(&format!("C{}", i), "a@example.com"))
            .collect();
        rows.push(customer_row("C100", "b@example.com"));
        rows[0] = customer_row("C100", "c@example.com");

        let result = check_duplicates(&customers(), &rows, 0.0, 10);
        assert!(result.failed());
        assert!((result.observed.unwrap() - 0.01).abs() < f64::EPSILON);
        assert_eq!(result.samples, vec!["C100"]);
    }

    #[test]
    fn test_duplicate_check_tolerates_rate_within_threshold() {
        let mut rows: Vec<Record> = (1..=99)
            .map(|i| txn_row(&format!("T{}", i), "C1", 10.0))
            .collect();
        rows.push(txn_row("T99", "C1", 10.0));

        let result = check_duplicates(&transactions(), &rows, 0.05, 10);
        assert!(!result.failed());
    }

    #[test]
    fn test_references_fail_on_missing_dimension_key() {
        let mut snapshot = DimensionSnapshot::new();
        snapshot.add_key("customers", "C1");

        let rows = vec![txn_row("T1", "C1", 5.0), txn_row("T2", "C9", 5.0)];
        let result = check_references(&transactions(), &rows, &snapshot, 10);
        assert!(result.failed());
        assert_eq!(result.samples, vec!["customer_id=C9"]);
    }

    #[test]
    fn test_references_pass_against_snapshot() {
        let mut snapshot = DimensionSnapshot::new();
        snapshot.add_key("customers", "C1");
        snapshot.add_key("customers", "C2");

        let rows = vec![txn_row("T1", "C1", 5.0), txn_row("T2", "C2", 7.5)];
        let result = check_references(&transactions(), &rows, &snapshot, 10);
        assert!(!result.failed());
    }

    #[test]
    fn test_references_against_empty_snapshot_all_fail() {
        let snapshot = DimensionSnapshot::new();
        let rows = vec![txn_row("T1", "C1", 5.0)];
        let result = check_references(&transactions(), &rows, &snapshot, 10);
        assert!(result.failed());
        assert!(result.message.contains("1 of 1"));
    }

    #[test]
    fn test_freshness_fails_outside_window() {
        let now = "2024-01-16T00:00:00Z".parse().unwrap();
        let rows = vec![customer_row("C1", "c1@example.com")];

        // Newest record is 14 hours old against a 6 hour window.
        let result = check_freshness(&customers(), &rows, now, Duration::from_secs(6 * 3600))
            .unwrap();
        assert!(result.failed());
        assert!(result.message.contains("staleness window"));
    }

    #[test]
    fn test_freshness_passes_inside_window() {
        let now = "2024-01-15T12:00:00Z".parse().unwrap();
        let rows = vec![customer_row("C1", "c1@example.com")];

        let result = check_freshness(&customers(), &rows, now, Duration::from_secs(6 * 3600))
            .unwrap();
        assert!(!result.failed());
    }

    #[test]
    fn test_freshness_skipped_without_column() {
        let now = Utc::now();
        let rows = vec![txn_row("T1", "C1", 5.0)];
        assert!(check_freshness(&transactions(), &rows, now, Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn test_freshness_fails_when_column_unparseable() {
        let now = Utc::now();
        let mut row = customer_row("C1", "c1@example.com");
        row.insert("updated_at".to_string(), json!("garbage"));

        let result = check_freshness(&customers(), &[row], now, Duration::from_secs(3600)).unwrap();
        assert!(result.failed());
    }

    #[test]
    fn test_row_count_warns_but_never_fails() {
        let result = check_row_count(&[], 100);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.message.contains("empty"));

        let rows = vec![customer_row("C1", "c1@example.com")];
        let result = check_row_count(&rows, 100);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(!result.failed());
    }

    #[test]
    fn test_ranges_fail_on_negative_amount() {
        let rows = vec![txn_row("T1", "C1", -4.0)];
        let result = check_ranges(&transactions(), &rows, 10).unwrap();
        assert!(result.failed());
        assert!(result.samples[0].contains("below minimum"));
    }

    #[test]
    fn test_ranges_fail_on_pattern_mismatch() {
        let rows = vec![customer_row("C1", "not-an-email")];
        let result = check_ranges(&customers(), &rows, 10).unwrap();
        assert!(result.failed());
        assert!(result.samples[0].contains("does not match pattern"));
    }

    #[test]
    fn test_sample_lists_are_bounded() {
        let rows: Vec<Record> = (0..50).map(|i| txn_row(&format!("T{}", i), "C1", -1.0)).collect();
        let result = check_ranges(&transactions(), &rows, 10).unwrap();
        assert_eq!(result.samples.len(), 10);
        assert!(result.message.contains("50 of 50"));
    }
}
