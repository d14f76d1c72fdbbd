//! Control-plane schema migrations.
//!
//! Migrations are named statements from [`super::schema`], applied once
//! each inside a transaction and remembered in a `_migrations` ledger.
//! Warehouse tables are not managed here; they come from the entity
//! catalog.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::schema;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// The ledger itself could not be read or written.
    #[error("Migration ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    /// A migration statement failed to execute.
    #[error("Migration '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

/// Applies control-plane migrations and answers what has been applied.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Brings the control-plane schema up to date. Already-applied
    /// migrations are skipped by name, so repeated calls are no-ops.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_ledger().await?;

        let mut applied = 0usize;
        for (name, sql) in schema::migrations() {
            if self.is_applied(name).await? {
                continue;
            }
            self.apply(name, sql).await?;
            applied += 1;
        }

        if applied > 0 {
            info!(applied, "Applied control-plane migrations");
        }
        Ok(())
    }

    /// Lists applied migrations in application order.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_ledger().await?;

        let applied =
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY applied_at, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(applied)
    }

    /// Drops every control-plane table, the ledger included. Destroys all
    /// run history; intended for development databases only.
    pub async fn reset_database(&self) -> Result<(), MigrationError> {
        // stage_results references pipeline_runs, so runs drop last.
        let drops = [
            "DROP TABLE IF EXISTS quarantine_records CASCADE",
            "DROP TABLE IF EXISTS pipeline_leases CASCADE",
            "DROP TABLE IF EXISTS stage_results CASCADE",
            "DROP TABLE IF EXISTS pipeline_runs CASCADE",
            "DROP TABLE IF EXISTS _migrations CASCADE",
        ];

        for statement in drops {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn ensure_ledger(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Runs one migration and its ledger entry in a single transaction, so
    /// a failed statement leaves no record behind.
    async fn apply(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::Failed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(%name, "Migration applied");
        Ok(())
    }
}

/// One row of the migration ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_migration_names_the_culprit() {
        let err = MigrationError::Failed {
            name: "create_pipeline_runs".to_string(),
            message: "relation exists".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("create_pipeline_runs"));
        assert!(text.contains("relation exists"));
    }
}
