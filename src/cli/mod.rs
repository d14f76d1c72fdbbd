//! Command-line interface for lakegate.
//!
//! Provides commands for pipeline runs, backfills, run history,
//! quarantine inspection, and schema migrations.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
