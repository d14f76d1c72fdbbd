//! Merge engine: staged rows into warehouse tables.
//!
//! Two strategies cover the star schema. Dimensions use upsert-by-key:
//! delete every natural key present in staging, then insert all staged
//! rows. Facts use partition replace: delete the month containing the
//! process date, then insert. Both are two-phase delete/insert pairs, so
//! re-running a merge converges on the same final state.
//!
//! Fact merges validate staged rows before the delete phase: every row
//! needs a date key inside the month window, and every declared reference
//! must resolve against the dimension tables as they stand after the
//! dimension merges. A failed validation aborts with the warehouse
//! untouched and staging intact.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{CatalogError, EntityCatalog, EntityConfig};
use crate::error::ErrorKind;
use crate::partition::month_bounds;

use super::store::{staging_table, WarehouseError, WarehouseStore};

/// How staged rows are folded into a warehouse table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Delete staged natural keys, insert all staged rows. Dimensions.
    UpsertByKey,
    /// Delete the month partition, insert all staged rows. Facts.
    ReplacePartition,
}

impl MergeStrategy {
    pub fn for_entity(entity: &EntityConfig) -> Self {
        if entity.is_dimension() {
            MergeStrategy::UpsertByKey
        } else {
            MergeStrategy::ReplacePartition
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeStrategy::UpsertByKey => "upsert_by_key",
            MergeStrategy::ReplacePartition => "replace_partition",
        };
        write!(f, "{}", s)
    }
}

/// Row counts from one completed merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub entity: String,
    pub table: String,
    pub strategy: MergeStrategy,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
}

/// Errors that can occur while merging staged rows.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Warehouse operation failed.
    #[error("Warehouse error: {0}")]
    Store(#[from] WarehouseError),

    /// Catalog lookup failed.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Staged fact rows reference keys absent from a dimension table.
    #[error("{count} staged rows in '{table}' reference keys missing from '{dimension}'")]
    UnresolvedReferences {
        table: String,
        dimension: String,
        count: u64,
    },

    /// A staged fact row has no date key.
    #[error("{count} staged rows in '{table}' have no date key")]
    MissingDateKey { table: String, count: u64 },

    /// Staged fact rows fall outside the month being replaced.
    #[error("{count} staged rows in '{table}' fall outside the partition month")]
    OutOfWindow { table: String, count: u64 },
}

impl MergeError {
    /// Classification used by the orchestrator to decide retries.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MergeError::Store(inner) => match inner {
                WarehouseError::ConnectionFailed(_) | WarehouseError::QueryFailed(_) => {
                    ErrorKind::Transient
                }
                WarehouseError::InvalidTable(_)
                | WarehouseError::MissingKey(_)
                | WarehouseError::MissingDateKey(_)
                | WarehouseError::Serialization(_) => ErrorKind::Schema,
            },
            MergeError::Catalog(_) => ErrorKind::Schema,
            MergeError::UnresolvedReferences { .. } | MergeError::OutOfWindow { .. } => {
                ErrorKind::Constraint
            }
            MergeError::MissingDateKey { .. } => ErrorKind::Schema,
        }
    }
}

/// Drives merges for all entities of a catalog, dimensions before facts.
pub struct MergeEngine {
    store: Arc<dyn WarehouseStore>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn WarehouseStore>) -> Self {
        Self { store }
    }

    /// Merges every entity in catalog order: dimensions first so fact
    /// reference validation sees the freshly merged keys.
    pub async fn merge_all(
        &self,
        catalog: &EntityCatalog,
        process_date: NaiveDate,
    ) -> Result<Vec<MergeOutcome>, MergeError> {
        let mut outcomes = Vec::new();
        for entity in catalog.merge_order() {
            outcomes.push(self.merge_entity(catalog, entity, process_date).await?);
        }
        Ok(outcomes)
    }

    /// Merges one entity's staged rows into its warehouse table.
    pub async fn merge_entity(
        &self,
        catalog: &EntityCatalog,
        entity: &EntityConfig,
        process_date: NaiveDate,
    ) -> Result<MergeOutcome, MergeError> {
        let table = entity.warehouse_table.clone();
        let staged = self.store.staged_rows(&staging_table(&table)).await?;
        let strategy = MergeStrategy::for_entity(entity);

        debug!(
            entity = %entity.name,
            table = %table,
            strategy = %strategy,
            staged = staged.len(),
            "starting merge"
        );

        let (rows_deleted, rows_inserted) = match strategy {
            MergeStrategy::UpsertByKey => {
                let mut keys: Vec<String> = staged.iter().map(|r| r.key.clone()).collect();
                keys.sort();
                keys.dedup();

                let deleted = self.store.delete_by_keys(&table, &keys).await?;
                let inserted = self.store.insert_rows(&table, &staged).await?;
                (deleted, inserted)
            }
            MergeStrategy::ReplacePartition => {
                let (start, end) = month_bounds(process_date);

                let undated = staged.iter().filter(|r| r.date_key.is_none()).count() as u64;
                if undated > 0 {
                    return Err(MergeError::MissingDateKey {
                        table,
                        count: undated,
                    });
                }

                let out_of_window = staged
                    .iter()
                    .filter(|r| {
                        r.date_key
                            .map(|d| d < start || d >= end)
                            .unwrap_or(false)
                    })
                    .count() as u64;
                if out_of_window > 0 {
                    return Err(MergeError::OutOfWindow {
                        table,
                        count: out_of_window,
                    });
                }

                self.validate_references(catalog, entity, &staged).await?;

                let deleted = self.store.delete_date_range(&table, start, end).await?;
                let inserted = self.store.insert_rows(&table, &staged).await?;
                (deleted, inserted)
            }
        };

        self.store.clear_staging(&staging_table(&table)).await?;

        info!(
            entity = %entity.name,
            table = %table,
            strategy = %strategy,
            rows_deleted,
            rows_inserted,
            "merge complete"
        );

        Ok(MergeOutcome {
            entity: entity.name.clone(),
            table,
            strategy,
            rows_deleted,
            rows_inserted,
        })
    }

    /// Checks every declared reference of `entity` against the current
    /// dimension tables. Runs before any mutation so a violation leaves
    /// the warehouse exactly as it was.
    async fn validate_references(
        &self,
        catalog: &EntityCatalog,
        entity: &EntityConfig,
        staged: &[super::store::WarehouseRow],
    ) -> Result<(), MergeError> {
        for reference in &entity.references {
            let dimension = catalog.entity(&reference.entity)?;
            let keys: HashSet<String> =
                self.store.natural_keys(&dimension.warehouse_table).await?;

            let missing = staged
                .iter()
                .filter_map(|row| row.field_key(&reference.field))
                .filter(|key| !keys.contains(key))
                .count() as u64;

            if missing > 0 {
                return Err(MergeError::UnresolvedReferences {
                    table: entity.warehouse_table.clone(),
                    dimension: dimension.warehouse_table.clone(),
                    count: missing,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityKind, FieldSchema, FieldType};
    use crate::warehouse::store::{MemoryWarehouse, WarehouseRow};
    use serde_json::json;

    fn catalog() -> EntityCatalog {
        EntityCatalog::new("customer360")
            .with_entity(EntityConfig::new(
                "customers",
                EntityKind::Dimension,
                "customer_id",
                "dim_customer",
            ))
            .with_entity(
                EntityConfig::new("transactions", EntityKind::Fact, "transaction_id", "fact_sales")
                    .with_date_key("transaction_date")
                    .with_field(FieldSchema::required("transaction_id", FieldType::String))
                    .with_reference("customer_id", "customers"),
            )
    }

    fn process_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn dim_row(key: &str, email: &str) -> WarehouseRow {
        WarehouseRow::new(key, json!({"customer_id": key, "email": email}))
    }

    fn fact_row(key: &str, customer: &str, date: &str) -> WarehouseRow {
        WarehouseRow::new(key, json!({"transaction_id": key, "customer_id": customer}))
            .with_date_key(date.parse().unwrap())
    }

    async fn engine_with_store() -> (MergeEngine, Arc<MemoryWarehouse>) {
        let store = Arc::new(MemoryWarehouse::new());
        (MergeEngine::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_upsert_inserts_and_clears_staging() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("customers").unwrap();

        store
            .stage_rows("stg_dim_customer", &[dim_row("C1", "a@x.com")])
            .await
            .unwrap();

        let outcome = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap();
        assert_eq!(outcome.strategy, MergeStrategy::UpsertByKey);
        assert_eq!(outcome.rows_deleted, 0);
        assert_eq!(outcome.rows_inserted, 1);

        assert_eq!(store.table_rows("dim_customer").await.unwrap().len(), 1);
        assert!(store.staged_rows("stg_dim_customer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_key_only() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("customers").unwrap();

        store
            .insert_rows(
                "dim_customer",
                &[dim_row("C1", "old@x.com"), dim_row("C2", "keep@x.com")],
            )
            .await
            .unwrap();
        store
            .stage_rows("stg_dim_customer", &[dim_row("C1", "new@x.com")])
            .await
            .unwrap();

        let outcome = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap();
        assert_eq!(outcome.rows_deleted, 1);
        assert_eq!(outcome.rows_inserted, 1);

        let rows = store.table_rows("dim_customer").await.unwrap();
        assert_eq!(rows.len(), 2);
        let c1 = rows.iter().find(|r| r.key == "C1").unwrap();
        assert_eq!(c1.payload["email"], json!("new@x.com"));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("customers").unwrap();

        for _ in 0..2 {
            store
                .stage_rows(
                    "stg_dim_customer",
                    &[dim_row("C1", "a@x.com"), dim_row("C2", "b@x.com")],
                )
                .await
                .unwrap();
            engine
                .merge_entity(&catalog, entity, process_date())
                .await
                .unwrap();
        }

        assert_eq!(store.table_rows("dim_customer").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_does_not_deduplicate_staging() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("customers").unwrap();

        store
            .stage_rows(
                "stg_dim_customer",
                &[dim_row("C100", "a@x.com"), dim_row("C100", "b@x.com")],
            )
            .await
            .unwrap();

        let outcome = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap();
        assert_eq!(outcome.rows_inserted, 2);
        assert_eq!(store.table_rows("dim_customer").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_partition_swaps_month_only() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("transactions").unwrap();

        store.insert_rows("dim_customer", &[dim_row("C1", "a@x.com")]).await.unwrap();
        store
            .insert_rows(
                "fact_sales",
                &[
                    fact_row("T1", "C1", "2024-01-02"),
                    fact_row("T2", "C1", "2023-12-30"),
                ],
            )
            .await
            .unwrap();
        store
            .stage_rows("stg_fact_sales", &[fact_row("T3", "C1", "2024-01-15")])
            .await
            .unwrap();

        let outcome = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap();
        assert_eq!(outcome.strategy, MergeStrategy::ReplacePartition);
        assert_eq!(outcome.rows_deleted, 1);
        assert_eq!(outcome.rows_inserted, 1);

        let keys: Vec<String> = store
            .table_rows("fact_sales")
            .await
            .unwrap()
            .iter()
            .map(|r| r.key.clone())
            .collect();
        assert_eq!(keys, vec!["T2", "T3"]);
    }

    #[tokio::test]
    async fn test_replace_partition_is_idempotent() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("transactions").unwrap();

        store.insert_rows("dim_customer", &[dim_row("C1", "a@x.com")]).await.unwrap();
        for _ in 0..2 {
            store
                .stage_rows(
                    "stg_fact_sales",
                    &[
                        fact_row("T1", "C1", "2024-01-14"),
                        fact_row("T2", "C1", "2024-01-15"),
                    ],
                )
                .await
                .unwrap();
            engine
                .merge_entity(&catalog, entity, process_date())
                .await
                .unwrap();
        }

        assert_eq!(store.table_rows("fact_sales").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_references_abort_without_mutation() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("transactions").unwrap();

        store
            .insert_rows("fact_sales", &[fact_row("T0", "C1", "2024-01-01")])
            .await
            .unwrap();
        store
            .stage_rows("stg_fact_sales", &[fact_row("T1", "C404", "2024-01-15")])
            .await
            .unwrap();

        let err = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert!(err.to_string().contains("dim_customer"));

        // Nothing deleted, nothing inserted, staging kept for retry.
        assert_eq!(store.table_rows("fact_sales").await.unwrap().len(), 1);
        assert_eq!(store.staged_rows("stg_fact_sales").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fact_rows_need_date_keys() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("transactions").unwrap();

        store
            .stage_rows(
                "stg_fact_sales",
                &[WarehouseRow::new("T1", json!({"transaction_id": "T1"}))],
            )
            .await
            .unwrap();

        let err = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[tokio::test]
    async fn test_fact_rows_outside_month_rejected() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("transactions").unwrap();

        store.insert_rows("dim_customer", &[dim_row("C1", "a@x.com")]).await.unwrap();
        store
            .stage_rows("stg_fact_sales", &[fact_row("T1", "C1", "2024-02-01")])
            .await
            .unwrap();

        let err = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert!(err.to_string().contains("outside the partition month"));
    }

    #[tokio::test]
    async fn test_merge_all_orders_dimensions_first() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();

        // Fact staging references a customer that only exists in dimension
        // staging; the merge succeeds because dimensions merge first.
        store
            .stage_rows("stg_dim_customer", &[dim_row("C7", "c7@x.com")])
            .await
            .unwrap();
        store
            .stage_rows("stg_fact_sales", &[fact_row("T1", "C7", "2024-01-15")])
            .await
            .unwrap();

        let outcomes = engine.merge_all(&catalog, process_date()).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].entity, "customers");
        assert_eq!(outcomes[1].entity, "transactions");
        assert_eq!(store.table_rows("fact_sales").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_staging_is_a_noop_merge() {
        let (engine, store) = engine_with_store().await;
        let catalog = catalog();
        let entity = catalog.entity("customers").unwrap();

        let outcome = engine
            .merge_entity(&catalog, entity, process_date())
            .await
            .unwrap();
        assert_eq!(outcome.rows_deleted, 0);
        assert_eq!(outcome.rows_inserted, 0);
        assert!(store.table_rows("dim_customer").await.unwrap().is_empty());
    }
}
