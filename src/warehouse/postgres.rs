//! PostgreSQL warehouse client.
//!
//! Every warehouse table and its staging counterpart share one layout:
//! `natural_key TEXT`, `date_key DATE`, `payload JSONB`, `loaded_at`.
//! Natural keys are deliberately not unique; duplicate handling belongs
//! to the quality gate and the merge engine's delete phase, and a runaway
//! upstream must be observable in the data rather than masked by a
//! constraint.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::catalog::EntityCatalog;

use super::store::{
    staging_table, validate_table_name, WarehouseError, WarehouseRow, WarehouseStore,
};

/// PostgreSQL-backed warehouse store.
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Connects to the warehouse database.
    pub async fn connect(warehouse_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(warehouse_url)
            .await
            .map_err(|e| WarehouseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a warehouse client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the warehouse and staging tables for every catalog entity.
    pub async fn ensure_tables(&self, catalog: &EntityCatalog) -> Result<(), WarehouseError> {
        for entity in &catalog.entities {
            let table = &entity.warehouse_table;
            validate_table_name(table)?;

            for target in [table.clone(), staging_table(table)] {
                sqlx::query(&create_table_sql(&target))
                    .execute(&self.pool)
                    .await?;
            }

            sqlx::query(&create_key_index_sql(table))
                .execute(&self.pool)
                .await?;

            if entity.date_key.is_some() {
                sqlx::query(&create_date_index_sql(table))
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            natural_key TEXT NOT NULL,
            date_key DATE,
            payload JSONB NOT NULL,
            loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        table
    )
}

fn create_key_index_sql(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{}_natural_key ON {} (natural_key)",
        table, table
    )
}

fn create_date_index_sql(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{}_date_key ON {} (date_key)",
        table, table
    )
}

#[async_trait]
impl WarehouseStore for PgWarehouse {
    async fn stage_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<(), WarehouseError> {
        validate_table_name(table)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;

        for row in rows {
            sqlx::query(&format!(
                "INSERT INTO {} (natural_key, date_key, payload) VALUES ($1, $2, $3)",
                table
            ))
            .bind(&row.key)
            .bind(row.date_key)
            .bind(&row.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn staged_rows(&self, table: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        validate_table_name(table)?;
        fetch_rows(&self.pool, table).await
    }

    async fn clear_staging(&self, table: &str) -> Result<(), WarehouseError> {
        validate_table_name(table)?;
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_keys(&self, table: &str, keys: &[String]) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;
        if keys.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE natural_key = ANY($1)",
            table
        ))
        .bind(keys)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_date_range(
        &self,
        table: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE date_key >= $1 AND date_key < $2",
            table
        ))
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;

        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&format!(
                "INSERT INTO {} (natural_key, date_key, payload) VALUES ($1, $2, $3)",
                table
            ))
            .bind(&row.key)
            .bind(row.date_key)
            .bind(&row.payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(rows.len() as u64)
    }

    async fn natural_keys(&self, table: &str) -> Result<HashSet<String>, WarehouseError> {
        validate_table_name(table)?;

        let rows = sqlx::query(&format!("SELECT DISTINCT natural_key FROM {}", table))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|r| r.get("natural_key")).collect())
    }

    async fn table_rows(&self, table: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        validate_table_name(table)?;
        fetch_rows(&self.pool, table).await
    }
}

async fn fetch_rows(pool: &PgPool, table: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
    let rows = sqlx::query(&format!(
        "SELECT natural_key, date_key, payload FROM {} ORDER BY natural_key",
        table
    ))
    .fetch_all(pool)
    .await?;

    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(WarehouseRow {
            key: row.get("natural_key"),
            date_key: row.get("date_key"),
            payload: row.get("payload"),
        });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_sql_shape() {
        let sql = create_table_sql("fact_sales");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS fact_sales"));
        assert!(sql.contains("natural_key TEXT NOT NULL"));
        assert!(sql.contains("payload JSONB NOT NULL"));
        // No unique constraint on the natural key.
        assert!(!sql.to_lowercase().contains("unique"));
        assert!(!sql.to_lowercase().contains("primary key"));
    }

    #[test]
    fn test_index_sql_names() {
        assert!(create_key_index_sql("dim_customer").contains("idx_dim_customer_natural_key"));
        assert!(create_date_index_sql("fact_sales").contains("idx_fact_sales_date_key"));
    }
}
