//! Warehouse storage and merge orchestration.
//!
//! The curated-to-warehouse stage loads staging tables; the merge engine
//! then folds staged rows into the dimensional model, dimensions before
//! facts. Postgres backs production; the in-memory store backs tests.

mod merge;
mod postgres;
mod store;

pub use merge::{MergeEngine, MergeError, MergeOutcome, MergeStrategy};
pub use postgres::PgWarehouse;
pub use store::{
    staging_table, validate_table_name, MemoryWarehouse, WarehouseError, WarehouseRow,
    WarehouseStore,
};
