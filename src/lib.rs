//! lakegate: Lake-to-warehouse pipeline orchestration.
//!
//! This library promotes daily lake partitions through clean and curated
//! layers, gates curated output on data quality, quarantines failing
//! partitions, and merges passing data into a star-schema warehouse.

// Core modules
pub mod alert;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod fsm;
pub mod lake;
pub mod metrics;
pub mod orchestrator;
pub mod partition;
pub mod quality;
pub mod quarantine;
pub mod run;
pub mod stage;
pub mod storage;
pub mod warehouse;

// Re-export the types most callers need
pub use catalog::{EntityCatalog, EntityConfig, EntityKind};
pub use config::{ConfigError, PipelineConfig};
pub use error::ErrorKind;
pub use fsm::{RunEvent, RunOutcome, RunState};
pub use orchestrator::{CancelHandle, Orchestrator, PipelineError};
pub use run::{PipelineRun, ProcessDate, RunStatus, RunTrigger, StageKind};
