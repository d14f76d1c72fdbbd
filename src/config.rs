//! Pipeline configuration for the orchestrator.
//!
//! This module provides configuration options for the promotion pipeline,
//! including the retry policy, stage timeouts, lake layout, stage executor
//! endpoint, storage URLs, and quality-gate thresholds.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::error::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_ATTEMPTS,
};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Identity
    /// Deployment environment name (dev, staging, prod).
    pub environment: String,
    /// Prefix for external stage job names.
    pub job_prefix: String,

    // Retry policy
    /// Maximum attempts for a retryable stage, first attempt included.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub backoff_base: Duration,
    /// Ceiling on a single backoff delay.
    pub backoff_cap: Duration,
    /// Uniform jitter added on top of each delay, as a fraction of it.
    pub jitter_fraction: f64,
    /// Timeout for one stage executor invocation; timeout counts as failure.
    pub stage_timeout: Duration,

    // Lake layout
    /// Root of the raw (immutable, append-only) layer.
    pub raw_root: PathBuf,
    /// Root of the clean layer.
    pub clean_root: PathBuf,
    /// Root of the curated layer.
    pub curated_root: PathBuf,
    /// Root of the quarantine area.
    pub quarantine_root: PathBuf,

    // Stage executor
    /// Base URL of the external job runner.
    pub executor_base_url: String,

    // Storage
    /// PostgreSQL connection URL for run state (runs, leases, quarantine).
    pub database_url: String,
    /// PostgreSQL connection URL for the target warehouse.
    pub warehouse_url: String,

    // Quality gate thresholds
    /// Maximum tolerated null rate per column (fraction).
    pub max_null_rate: f64,
    /// Maximum tolerated duplicate rate on the primary key (fraction).
    pub max_duplicate_rate: f64,
    /// Minimum expected rows per partition.
    pub min_row_count: u64,
    /// Staleness window for the freshness check.
    pub staleness_window: Duration,
    /// Upper bound on offending-key samples carried in a report.
    pub sample_limit: usize,

    // Backfill
    /// How many process dates a backfill drives concurrently.
    pub backfill_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            // Identity defaults
            environment: "dev".to_string(),
            job_prefix: "c360".to_string(),

            // Retry defaults
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            stage_timeout: Duration::from_secs(1800), // 30 minutes

            // Lake defaults
            raw_root: PathBuf::from("./lake/raw"),
            clean_root: PathBuf::from("./lake/clean"),
            curated_root: PathBuf::from("./lake/curated"),
            quarantine_root: PathBuf::from("./lake/quarantine"),

            // Executor defaults
            executor_base_url: "http://localhost:8700".to_string(),

            // Storage defaults
            database_url: "postgres://localhost/lakegate".to_string(),
            warehouse_url: "postgres://localhost/lakegate".to_string(),

            // Quality defaults
            max_null_rate: 0.05,
            max_duplicate_rate: 0.01,
            min_row_count: 100,
            staleness_window: Duration::from_secs(6 * 3600), // 6 hours
            sample_limit: 10,

            // Backfill defaults
            backfill_concurrency: 4,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LAKEGATE_ENVIRONMENT`: Deployment environment (default: dev)
    /// - `LAKEGATE_JOB_PREFIX`: Stage job name prefix (default: c360)
    /// - `LAKEGATE_MAX_ATTEMPTS`: Stage retry attempts (default: 3)
    /// - `LAKEGATE_BACKOFF_BASE_SECS`: Backoff base in seconds (default: 30)
    /// - `LAKEGATE_BACKOFF_CAP_SECS`: Backoff ceiling in seconds (default: 300)
    /// - `LAKEGATE_JITTER_FRACTION`: Backoff jitter fraction (default: 0.1)
    /// - `LAKEGATE_STAGE_TIMEOUT_SECS`: Stage timeout in seconds (default: 1800)
    /// - `LAKEGATE_RAW_ROOT`: Raw layer root (default: ./lake/raw)
    /// - `LAKEGATE_CLEAN_ROOT`: Clean layer root (default: ./lake/clean)
    /// - `LAKEGATE_CURATED_ROOT`: Curated layer root (default: ./lake/curated)
    /// - `LAKEGATE_QUARANTINE_ROOT`: Quarantine root (default: ./lake/quarantine)
    /// - `LAKEGATE_EXECUTOR_URL`: Job runner base URL (default: http://localhost:8700)
    /// - `DATABASE_URL`: Run-state PostgreSQL URL (required)
    /// - `WAREHOUSE_URL`: Warehouse PostgreSQL URL (defaults to `DATABASE_URL`)
    /// - `LAKEGATE_MAX_NULL_RATE`: Null-rate threshold (default: 0.05)
    /// - `LAKEGATE_MAX_DUPLICATE_RATE`: Duplicate-rate threshold (default: 0.01)
    /// - `LAKEGATE_MIN_ROW_COUNT`: Row-count floor (default: 100)
    /// - `LAKEGATE_STALENESS_HOURS`: Freshness window in hours (default: 6)
    /// - `LAKEGATE_SAMPLE_LIMIT`: Offending-key sample bound (default: 10)
    /// - `LAKEGATE_BACKFILL_CONCURRENCY`: Concurrent backfill dates (default: 4)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Identity settings
        if let Ok(val) = std::env::var("LAKEGATE_ENVIRONMENT") {
            config.environment = val;
        }

        if let Ok(val) = std::env::var("LAKEGATE_JOB_PREFIX") {
            config.job_prefix = val;
        }

        // Retry settings
        if let Ok(val) = std::env::var("LAKEGATE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "LAKEGATE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("LAKEGATE_BACKOFF_BASE_SECS") {
            let secs: u64 = parse_env_value(&val, "LAKEGATE_BACKOFF_BASE_SECS")?;
            config.backoff_base = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LAKEGATE_BACKOFF_CAP_SECS") {
            let secs: u64 = parse_env_value(&val, "LAKEGATE_BACKOFF_CAP_SECS")?;
            config.backoff_cap = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LAKEGATE_JITTER_FRACTION") {
            config.jitter_fraction = parse_env_value(&val, "LAKEGATE_JITTER_FRACTION")?;
        }

        if let Ok(val) = std::env::var("LAKEGATE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "LAKEGATE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = Duration::from_secs(secs);
        }

        // Lake settings
        if let Ok(val) = std::env::var("LAKEGATE_RAW_ROOT") {
            config.raw_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("LAKEGATE_CLEAN_ROOT") {
            config.clean_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("LAKEGATE_CURATED_ROOT") {
            config.curated_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("LAKEGATE_QUARANTINE_ROOT") {
            config.quarantine_root = PathBuf::from(val);
        }

        // Executor settings
        if let Ok(val) = std::env::var("LAKEGATE_EXECUTOR_URL") {
            config.executor_base_url = val;
        }

        // Storage settings - DATABASE_URL is required
        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        config.warehouse_url =
            std::env::var("WAREHOUSE_URL").unwrap_or_else(|_| config.database_url.clone());

        // Quality settings
        if let Ok(val) = std::env::var("LAKEGATE_MAX_NULL_RATE") {
            config.max_null_rate = parse_env_value(&val, "LAKEGATE_MAX_NULL_RATE")?;
        }

        if let Ok(val) = std::env::var("LAKEGATE_MAX_DUPLICATE_RATE") {
            config.max_duplicate_rate = parse_env_value(&val, "LAKEGATE_MAX_DUPLICATE_RATE")?;
        }

        if let Ok(val) = std::env::var("LAKEGATE_MIN_ROW_COUNT") {
            config.min_row_count = parse_env_value(&val, "LAKEGATE_MIN_ROW_COUNT")?;
        }

        if let Ok(val) = std::env::var("LAKEGATE_STALENESS_HOURS") {
            let hours: u64 = parse_env_value(&val, "LAKEGATE_STALENESS_HOURS")?;
            config.staleness_window = Duration::from_secs(hours * 3600);
        }

        if let Ok(val) = std::env::var("LAKEGATE_SAMPLE_LIMIT") {
            config.sample_limit = parse_env_value(&val, "LAKEGATE_SAMPLE_LIMIT")?;
        }

        // Backfill settings
        if let Ok(val) = std::env::var("LAKEGATE_BACKFILL_CONCURRENCY") {
            config.backfill_concurrency = parse_env_value(&val, "LAKEGATE_BACKFILL_CONCURRENCY")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Identity validation
        if self.environment.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "environment cannot be empty".to_string(),
            ));
        }

        if self.job_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "job_prefix cannot be empty".to_string(),
            ));
        }

        // Retry validation
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.backoff_base.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "backoff_base must be greater than 0".to_string(),
            ));
        }

        if self.backoff_cap < self.backoff_base {
            return Err(ConfigError::ValidationFailed(
                "backoff_cap cannot be smaller than backoff_base".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::ValidationFailed(
                "jitter_fraction must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.stage_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        // Executor validation
        if self.executor_base_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "executor_base_url cannot be empty".to_string(),
            ));
        }

        // Storage validation
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.warehouse_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "warehouse_url cannot be empty".to_string(),
            ));
        }

        // Quality validation
        if !(0.0..=1.0).contains(&self.max_null_rate) {
            return Err(ConfigError::ValidationFailed(
                "max_null_rate must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.max_duplicate_rate) {
            return Err(ConfigError::ValidationFailed(
                "max_duplicate_rate must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.staleness_window.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "staleness_window must be greater than 0".to_string(),
            ));
        }

        if self.sample_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "sample_limit must be greater than 0".to_string(),
            ));
        }

        // Backfill validation
        if self.backfill_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "backfill_concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the environment name.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Builder method to set the job prefix.
    pub fn with_job_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.job_prefix = prefix.into();
        self
    }

    /// Builder method to set maximum stage attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder method to set the backoff base.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Builder method to set the backoff ceiling.
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Builder method to set the jitter fraction.
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Builder method to set the stage timeout.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Builder method to set all four lake roots under one directory.
    pub fn with_lake_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.raw_root = root.join("raw");
        self.clean_root = root.join("clean");
        self.curated_root = root.join("curated");
        self.quarantine_root = root.join("quarantine");
        self
    }

    /// Builder method to set the executor base URL.
    pub fn with_executor_base_url(mut self, url: impl Into<String>) -> Self {
        self.executor_base_url = url.into();
        self
    }

    /// Builder method to set the run-state database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the warehouse database URL.
    pub fn with_warehouse_url(mut self, url: impl Into<String>) -> Self {
        self.warehouse_url = url.into();
        self
    }

    /// Builder method to set the null-rate threshold.
    pub fn with_max_null_rate(mut self, rate: f64) -> Self {
        self.max_null_rate = rate;
        self
    }

    /// Builder method to set the duplicate-rate threshold.
    pub fn with_max_duplicate_rate(mut self, rate: f64) -> Self {
        self.max_duplicate_rate = rate;
        self
    }

    /// Builder method to set the row-count floor.
    pub fn with_min_row_count(mut self, count: u64) -> Self {
        self.min_row_count = count;
        self
    }

    /// Builder method to set the staleness window.
    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    /// Builder method to set the offending-key sample bound.
    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    /// Builder method to set backfill concurrency.
    pub fn with_backfill_concurrency(mut self, concurrency: usize) -> Self {
        self.backfill_concurrency = concurrency;
        self
    }

    /// External job name for a stage, e.g. `c360-raw-to-clean-dev`.
    pub fn job_name(&self, job: &str) -> String {
        format!("{}-{}-{}", self.job_prefix, job, self.environment)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
