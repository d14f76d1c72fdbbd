//! Warehouse row model and store abstraction.
//!
//! Warehouse tables share one shape regardless of entity: a natural key,
//! an optional date key for facts, and the full record as a JSON payload.
//! The [`WarehouseStore`] trait is the seam between the merge engine and
//! the physical warehouse; production uses Postgres, tests and dry runs
//! use the in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::catalog::{parse_date_value, value_to_key, EntityConfig};
use crate::lake::Record;

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// Connection to the warehouse failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Table name is not a safe SQL identifier.
    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    /// A record is missing its natural key.
    #[error("Record has no value for key field '{0}'")]
    MissingKey(String),

    /// A fact record's date key is absent or unparseable.
    #[error("Record has no usable date in field '{0}'")]
    MissingDateKey(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One warehouse row: natural key, fact date, and the record itself.
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseRow {
    pub key: String,
    pub date_key: Option<NaiveDate>,
    pub payload: serde_json::Value,
}

impl WarehouseRow {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            date_key: None,
            payload,
        }
    }

    pub fn with_date_key(mut self, date: NaiveDate) -> Self {
        self.date_key = Some(date);
        self
    }

    /// Builds a warehouse row from a curated record using the entity's
    /// key declarations. Facts must carry a parseable date key.
    pub fn from_record(entity: &EntityConfig, record: &Record) -> Result<Self, WarehouseError> {
        let key = record
            .get(&entity.primary_key)
            .and_then(value_to_key)
            .ok_or_else(|| WarehouseError::MissingKey(entity.primary_key.clone()))?;

        let date_key = match entity.date_key.as_deref() {
            Some(field) => Some(
                record
                    .get(field)
                    .and_then(parse_date_value)
                    .ok_or_else(|| WarehouseError::MissingDateKey(field.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            key,
            date_key,
            payload: serde_json::Value::Object(record.clone()),
        })
    }

    /// Foreign key value from the payload, if present and non-null.
    pub fn field_key(&self, field: &str) -> Option<String> {
        self.payload.get(field).and_then(value_to_key)
    }
}

/// Name of the staging table feeding a warehouse table.
pub fn staging_table(table: &str) -> String {
    format!("stg_{}", table)
}

/// Rejects table names that cannot be safely interpolated into SQL.
pub fn validate_table_name(table: &str) -> Result<(), WarehouseError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(WarehouseError::InvalidTable(table.to_string()))
    }
}

/// Storage seam for warehouse tables and their staging counterparts.
///
/// Implementations never enforce uniqueness on the natural key: the merge
/// engine's delete phase is the only dedup mechanism, so duplicated
/// staging keys surface as duplicated warehouse rows.
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Replaces the contents of a staging table.
    async fn stage_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<(), WarehouseError>;

    /// Reads all rows currently staged for a table.
    async fn staged_rows(&self, table: &str) -> Result<Vec<WarehouseRow>, WarehouseError>;

    /// Empties a staging table.
    async fn clear_staging(&self, table: &str) -> Result<(), WarehouseError>;

    /// Deletes rows whose natural key is in `keys`. Returns rows deleted.
    async fn delete_by_keys(&self, table: &str, keys: &[String]) -> Result<u64, WarehouseError>;

    /// Deletes rows whose date key falls in `[start, end)`. Returns rows
    /// deleted.
    async fn delete_date_range(
        &self,
        table: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64, WarehouseError>;

    /// Appends rows to a table. Returns rows inserted.
    async fn insert_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<u64, WarehouseError>;

    /// All natural keys currently in a table.
    async fn natural_keys(&self, table: &str) -> Result<HashSet<String>, WarehouseError>;

    /// All rows of a table, ordered by natural key.
    async fn table_rows(&self, table: &str) -> Result<Vec<WarehouseRow>, WarehouseError>;
}

/// In-memory warehouse for tests and local dry runs.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, Vec<WarehouseRow>>>,
    staging: Mutex<HashMap<String, Vec<WarehouseRow>>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WarehouseStore for MemoryWarehouse {
    async fn stage_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<(), WarehouseError> {
        validate_table_name(table)?;
        let mut staging = self.staging.lock().expect("staging lock poisoned");
        staging.insert(table.to_string(), rows.to_vec());
        Ok(())
    }

    async fn staged_rows(&self, table: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let staging = self.staging.lock().expect("staging lock poisoned");
        Ok(staging.get(table).cloned().unwrap_or_default())
    }

    async fn clear_staging(&self, table: &str) -> Result<(), WarehouseError> {
        let mut staging = self.staging.lock().expect("staging lock poisoned");
        staging.remove(table);
        Ok(())
    }

    async fn delete_by_keys(&self, table: &str, keys: &[String]) -> Result<u64, WarehouseError> {
        let key_set: HashSet<&String> = keys.iter().collect();
        let mut tables = self.tables.lock().expect("tables lock poisoned");
        let rows = tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| !key_set.contains(&row.key));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_date_range(
        &self,
        table: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64, WarehouseError> {
        let mut tables = self.tables.lock().expect("tables lock poisoned");
        let rows = tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| match row.date_key {
            Some(date) => date < start || date >= end,
            None => true,
        });
        Ok((before - rows.len()) as u64)
    }

    async fn insert_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;
        let mut tables = self.tables.lock().expect("tables lock poisoned");
        let target = tables.entry(table.to_string()).or_default();
        target.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn natural_keys(&self, table: &str) -> Result<HashSet<String>, WarehouseError> {
        let tables = self.tables.lock().expect("tables lock poisoned");
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default())
    }

    async fn table_rows(&self, table: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let tables = self.tables.lock().expect("tables lock poisoned");
        let mut rows = tables.get(table).cloned().unwrap_or_default();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityKind, FieldSchema, FieldType};
    use serde_json::json;

    fn fact_entity() -> EntityConfig {
        EntityConfig::new("transactions", EntityKind::Fact, "transaction_id", "fact_sales")
            .with_date_key("transaction_date")
            .with_field(FieldSchema::required("transaction_id", FieldType::String))
    }

    fn row(key: &str, date: Option<&str>) -> WarehouseRow {
        let mut r = WarehouseRow::new(key, json!({"k": key}));
        if let Some(d) = date {
            r = r.with_date_key(d.parse().unwrap());
        }
        r
    }

    #[test]
    fn test_from_record_extracts_keys() {
        let mut record = Record::new();
        record.insert("transaction_id".to_string(), json!("T1"));
        record.insert("transaction_date".to_string(), json!("2024-01-15"));

        let row = WarehouseRow::from_record(&fact_entity(), &record).unwrap();
        assert_eq!(row.key, "T1");
        assert_eq!(row.date_key, Some(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()));
        assert_eq!(row.payload["transaction_id"], json!("T1"));
    }

    #[test]
    fn test_from_record_requires_key() {
        let record = Record::new();
        let err = WarehouseRow::from_record(&fact_entity(), &record).unwrap_err();
        assert!(err.to_string().contains("transaction_id"));
    }

    #[test]
    fn test_from_record_requires_fact_date() {
        let mut record = Record::new();
        record.insert("transaction_id".to_string(), json!("T1"));
        record.insert("transaction_date".to_string(), json!("not a date"));

        let err = WarehouseRow::from_record(&fact_entity(), &record).unwrap_err();
        assert!(err.to_string().contains("transaction_date"));
    }

    #[test]
    fn test_staging_table_name() {
        assert_eq!(staging_table("dim_customer"), "stg_dim_customer");
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("fact_sales").is_ok());
        assert!(validate_table_name("stg_dim_customer").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("t; DROP TABLE runs").is_err());
        assert!(validate_table_name("Fact_Sales").is_err());
    }

    #[tokio::test]
    async fn test_memory_staging_replaces_contents() {
        let store = MemoryWarehouse::new();
        store
            .stage_rows("stg_dim_customer", &[row("C1", None)])
            .await
            .unwrap();
        store
            .stage_rows("stg_dim_customer", &[row("C2", None), row("C3", None)])
            .await
            .unwrap();

        let staged = store.staged_rows("stg_dim_customer").await.unwrap();
        assert_eq!(staged.len(), 2);

        store.clear_staging("stg_dim_customer").await.unwrap();
        assert!(store.staged_rows("stg_dim_customer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_delete_by_keys() {
        let store = MemoryWarehouse::new();
        store
            .insert_rows(
                "dim_customer",
                &[row("C1", None), row("C2", None), row("C1", None)],
            )
            .await
            .unwrap();

        let deleted = store
            .delete_by_keys("dim_customer", &["C1".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let keys = store.natural_keys("dim_customer").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("C2"));
    }

    #[tokio::test]
    async fn test_memory_delete_date_range_is_half_open() {
        let store = MemoryWarehouse::new();
        store
            .insert_rows(
                "fact_sales",
                &[
                    row("T1", Some("2024-01-01")),
                    row("T2", Some("2024-01-31")),
                    row("T3", Some("2024-02-01")),
                    row("T4", Some("2023-12-31")),
                ],
            )
            .await
            .unwrap();

        let deleted = store
            .delete_date_range(
                "fact_sales",
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining = store.table_rows("fact_sales").await.unwrap();
        let keys: Vec<&str> = remaining.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["T3", "T4"]);
    }

    #[tokio::test]
    async fn test_memory_insert_keeps_duplicates() {
        let store = MemoryWarehouse::new();
        store
            .insert_rows("dim_customer", &[row("C100", None), row("C100", None)])
            .await
            .unwrap();

        let rows = store.table_rows("dim_customer").await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
