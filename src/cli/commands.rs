//! CLI command definitions for lakegate.
//!
//! Commands start pipeline runs, backfill date ranges, inspect run history
//! and quarantine records, and manage the control-plane schema.

use crate::alert::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::catalog::EntityCatalog;
use crate::config::{ConfigError, PipelineConfig};
use crate::lake::LakeStore;
use crate::metrics::export_metrics;
use crate::orchestrator::Orchestrator;
use crate::run::{PipelineRun, ProcessDate, RunStatus, RunTrigger, StageStatus};
use crate::stage::HttpStageExecutor;
use crate::storage::{Database, MigrationRunner, RunFilter, RunStore};
use crate::warehouse::PgWarehouse;
use chrono::NaiveDate;
use clap::Parser;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Default trigger source recorded on manually started runs.
const DEFAULT_TRIGGERED_BY: &str = "manual";

/// Default number of rows listed by `lakegate history`.
const DEFAULT_HISTORY_LIMIT: &str = "20";

/// Lake-to-warehouse pipeline orchestrator.
#[derive(Parser)]
#[command(name = "lakegate")]
#[command(about = "Promote lake partitions into a star-schema warehouse behind a quality gate")]
#[command(version)]
#[command(
    long_about = "lakegate drives raw data through the clean and curated lake layers, evaluates \
a quality gate over the curated output, quarantines failing partitions, and merges passing data \
into warehouse dimension and fact tables with idempotent loads.\n\nExample usage:\n  \
lakegate run --date 2024-01-15 --catalog catalog.yaml\n  \
lakegate backfill --start 2024-01-01 --end 2024-01-31"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline for one process date.
    Run(RunArgs),

    /// Run the pipeline for every date in a range.
    #[command(alias = "bf")]
    Backfill(BackfillArgs),

    /// Show one run with its stage results.
    Status(StatusArgs),

    /// List recent runs.
    #[command(alias = "hist")]
    History(HistoryArgs),

    /// List quarantine records for a process date.
    Quarantine(QuarantineArgs),

    /// Apply control-plane schema migrations.
    Migrate(MigrateArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Process date to run, or "auto" for yesterday (UTC).
    #[arg(short = 'd', long, default_value = "auto")]
    pub date: String,

    /// Deployment environment recorded on the run.
    #[arg(short = 'e', long)]
    pub environment: Option<String>,

    /// Trigger source recorded on the run.
    #[arg(long, default_value = DEFAULT_TRIGGERED_BY)]
    pub triggered_by: String,

    /// Entity catalog YAML file. Defaults to the built-in customer360 catalog.
    #[arg(short = 'c', long)]
    pub catalog: Option<String>,

    /// Control-plane Postgres URL (can also be set via DATABASE_URL env var).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Warehouse Postgres URL. Defaults to the control-plane database.
    #[arg(long, env = "WAREHOUSE_URL")]
    pub warehouse_url: Option<String>,

    /// Base URL of the stage executor service.
    #[arg(long, env = "LAKEGATE_EXECUTOR_URL")]
    pub executor_url: Option<String>,

    /// Webhook endpoint for alerts. Alerts go to the log when unset.
    #[arg(long, env = "LAKEGATE_ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    /// Output the run summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print Prometheus metrics to stdout after the run.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for the backfill command.
#[derive(Parser, Debug)]
pub struct BackfillArgs {
    /// First process date in the range (YYYY-MM-DD, inclusive).
    #[arg(short = 's', long)]
    pub start: String,

    /// Last process date in the range (YYYY-MM-DD, inclusive).
    #[arg(short = 'e', long)]
    pub end: String,

    /// Entity catalog YAML file. Defaults to the built-in customer360 catalog.
    #[arg(short = 'c', long)]
    pub catalog: Option<String>,

    /// Control-plane Postgres URL (can also be set via DATABASE_URL env var).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Warehouse Postgres URL. Defaults to the control-plane database.
    #[arg(long, env = "WAREHOUSE_URL")]
    pub warehouse_url: Option<String>,

    /// Base URL of the stage executor service.
    #[arg(long, env = "LAKEGATE_EXECUTOR_URL")]
    pub executor_url: Option<String>,

    /// Webhook endpoint for alerts. Alerts go to the log when unset.
    #[arg(long, env = "LAKEGATE_ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    /// Output the backfill summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print Prometheus metrics to stdout after the backfill.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for the status command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Run id to inspect.
    pub run_id: String,

    /// Control-plane Postgres URL (can also be set via DATABASE_URL env var).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Output the run as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the history command.
#[derive(Parser, Debug)]
pub struct HistoryArgs {
    /// Only show runs for this process date (YYYY-MM-DD).
    #[arg(short = 'd', long)]
    pub date: Option<String>,

    /// Only show runs with this status (running, succeeded, failed, quarantined).
    #[arg(short = 's', long)]
    pub status: Option<String>,

    /// Maximum number of runs to list.
    #[arg(short = 'n', long, default_value = DEFAULT_HISTORY_LIMIT)]
    pub limit: i64,

    /// Control-plane Postgres URL (can also be set via DATABASE_URL env var).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Output the history as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the quarantine command.
#[derive(Parser, Debug)]
pub struct QuarantineArgs {
    /// Process date to list quarantine records for (YYYY-MM-DD).
    #[arg(short = 'd', long)]
    pub date: String,

    /// Control-plane Postgres URL (can also be set via DATABASE_URL env var).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Output the records as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the migrate command.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Control-plane Postgres URL (can also be set via DATABASE_URL env var).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Drop all control-plane tables before migrating.
    #[arg(long)]
    pub reset: bool,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI arguments and executes the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Executes the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await,
        Commands::Backfill(args) => run_backfill_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::History(args) => run_history_command(args).await,
        Commands::Quarantine(args) => run_quarantine_command(args).await,
        Commands::Migrate(args) => run_migrate_command(args).await,
    }
}

/// JSON output for a single stage of a run.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutput {
    pub stage: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub records_in: u64,
    pub records_out: u64,
    pub error: Option<String>,
}

/// JSON output for a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub entity_group: String,
    pub process_date: NaiveDate,
    pub environment: String,
    pub status: RunStatus,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
    pub stages: Vec<StageOutput>,
}

impl RunOutput {
    fn from_run(run: &PipelineRun) -> Self {
        Self {
            run_id: run.id,
            entity_group: run.entity_group.clone(),
            process_date: run.process_date,
            environment: run.environment.clone(),
            status: run.status,
            duration_secs: run.duration().map(|d| d.as_secs_f64()),
            error: run.error.clone(),
            stages: run
                .stages
                .iter()
                .map(|stage| StageOutput {
                    stage: stage.stage.to_string(),
                    status: stage.status,
                    attempts: stage.attempts,
                    records_in: stage.records_in,
                    records_out: stage.records_out,
                    error: stage.error.clone(),
                })
                .collect(),
        }
    }
}

/// JSON output for one date of a backfill.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillEntry {
    pub date: NaiveDate,
    pub status: String,
    pub run_id: Option<Uuid>,
    pub error: Option<String>,
}

/// JSON output for a backfill.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillOutput {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub dates: usize,
    pub succeeded: usize,
    pub quarantined: usize,
    pub failed: usize,
    pub rejected: usize,
    pub results: Vec<BackfillEntry>,
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let process_date = ProcessDate::from_str(&args.date)
        .map_err(|e| anyhow::anyhow!("Invalid --date '{}': {}", args.date, e))?;

    let orchestrator = build_orchestrator(
        args.database_url,
        args.warehouse_url,
        args.executor_url,
        args.alert_webhook,
        args.catalog.as_deref(),
    )
    .await?;

    let mut trigger = RunTrigger::new(process_date).with_triggered_by(args.triggered_by);
    if let Some(environment) = args.environment {
        trigger = trigger.with_environment(environment);
    }

    let run = orchestrator.run(&trigger).await?;

    print_run(&run, args.json)?;
    if args.print_metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

async fn run_backfill_command(args: BackfillArgs) -> anyhow::Result<()> {
    let start = parse_date(&args.start)?;
    let end = parse_date(&args.end)?;
    if end < start {
        anyhow::bail!("--end {} is before --start {}", end, start);
    }

    let orchestrator = build_orchestrator(
        args.database_url,
        args.warehouse_url,
        args.executor_url,
        args.alert_webhook,
        args.catalog.as_deref(),
    )
    .await?;

    let results = orchestrator.backfill(start, end).await;

    let mut output = BackfillOutput {
        start,
        end,
        dates: results.len(),
        succeeded: 0,
        quarantined: 0,
        failed: 0,
        rejected: 0,
        results: Vec::with_capacity(results.len()),
    };
    for (date, result) in &results {
        match result {
            Ok(run) => {
                match run.status {
                    RunStatus::Succeeded => output.succeeded += 1,
                    RunStatus::Quarantined => output.quarantined += 1,
                    _ => output.failed += 1,
                }
                output.results.push(BackfillEntry {
                    date: *date,
                    status: run.status.to_string(),
                    run_id: Some(run.id),
                    error: run.error.clone(),
                });
            }
            Err(e) => {
                // Rejected dates never produced a run record, e.g. a lease
                // already held by a concurrent scheduler.
                output.rejected += 1;
                output.results.push(BackfillEntry {
                    date: *date,
                    status: "rejected".to_string(),
                    run_id: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("\n=== Backfill {} .. {} ===", output.start, output.end);
        println!("Dates:       {}", output.dates);
        println!("Succeeded:   {}", output.succeeded);
        println!("Quarantined: {}", output.quarantined);
        println!("Failed:      {}", output.failed);
        println!("Rejected:    {}", output.rejected);
        println!();
        for entry in &output.results {
            let run_id = entry
                .run_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  {} {:<12} {}", entry.date, entry.status, run_id);
            if let Some(error) = &entry.error {
                println!("    {}", error);
            }
        }
    }

    if args.print_metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let run_id = Uuid::parse_str(&args.run_id)
        .map_err(|e| anyhow::anyhow!("Invalid run id '{}': {}", args.run_id, e))?;

    let store = connect_store(args.database_url).await?;
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No run found with id {}", run_id))?;

    print_run(&run, args.json)
}

async fn run_history_command(args: HistoryArgs) -> anyhow::Result<()> {
    let store = connect_store(args.database_url).await?;

    let mut filter = RunFilter::new().with_limit(args.limit);
    if let Some(raw) = &args.date {
        filter = filter.with_process_date(parse_date(raw)?);
    }
    if let Some(raw) = &args.status {
        filter = filter.with_status(parse_status(raw)?);
    }

    let runs = store.list_runs(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10}  {:<8}  {:<11}  {}",
        "RUN ID", "DATE", "ENV", "STATUS", "STARTED"
    );
    for run in &runs {
        println!(
            "{:<36}  {:<10}  {:<8}  {:<11}  {}",
            run.id.to_string(),
            run.process_date.to_string(),
            run.environment,
            run.status.to_string(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn run_quarantine_command(args: QuarantineArgs) -> anyhow::Result<()> {
    let date = parse_date(&args.date)?;
    let store = connect_store(args.database_url).await?;
    let records = store.list_quarantine(date).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No quarantine records for {}.", date);
        return Ok(());
    }
    println!("\n=== Quarantine for {} ===", date);
    for record in &records {
        println!("  {} (run {})", record.entity, record.run_id);
        println!("    location: {}", record.location);
        println!("    checks:   {}", record.failing_checks.join(", "));
    }
    Ok(())
}

async fn run_migrate_command(args: MigrateArgs) -> anyhow::Result<()> {
    let database = connect_store(args.database_url).await?;
    let runner = MigrationRunner::new(database.pool().clone());

    if args.reset {
        warn!("Dropping all control-plane tables before migrating");
        runner.reset_database().await?;
    }
    database.run_migrations().await?;

    let applied = runner.list_applied_migrations().await?;
    println!("Applied migrations: {}", applied.len());
    for migration in &applied {
        println!(
            "  {} ({})",
            migration.name,
            migration.applied_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

/// Builds a fully wired orchestrator from CLI arguments and the environment.
async fn build_orchestrator(
    database_url: Option<String>,
    warehouse_url: Option<String>,
    executor_url: Option<String>,
    alert_webhook: Option<String>,
    catalog_path: Option<&str>,
) -> anyhow::Result<Orchestrator> {
    let config = resolve_config(database_url, warehouse_url, executor_url)?;
    let catalog = load_catalog(catalog_path)?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let warehouse = PgWarehouse::connect(&config.warehouse_url).await?;
    warehouse.ensure_tables(&catalog).await?;

    let lake = Arc::new(LakeStore::from_config(&config));
    let executor = Arc::new(HttpStageExecutor::from_config(&config));
    let alerts: Arc<dyn AlertSink> = match alert_webhook {
        Some(url) => {
            info!(url = %url, "Sending alerts to webhook");
            Arc::new(WebhookAlertSink::new(url))
        }
        None => Arc::new(LogAlertSink),
    };

    Ok(Orchestrator::new(
        config,
        catalog,
        Arc::new(database),
        executor,
        Arc::new(warehouse),
        lake,
        alerts,
    ))
}

/// Resolves configuration from the environment with CLI flags taking precedence.
fn resolve_config(
    database_url: Option<String>,
    warehouse_url: Option<String>,
    executor_url: Option<String>,
) -> anyhow::Result<PipelineConfig> {
    let mut config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::MissingEnvVar(_)) if database_url.is_some() => PipelineConfig::default(),
        Err(e) => {
            return Err(anyhow::anyhow!(
                "{e}.\nProvide --database-url <URL> or set the DATABASE_URL environment variable."
            ));
        }
    };

    if let Some(url) = database_url {
        // An unconfigured warehouse follows the control-plane database.
        if config.warehouse_url == config.database_url {
            config = config.with_warehouse_url(url.clone());
        }
        config = config.with_database_url(url);
    }
    if let Some(url) = warehouse_url {
        config = config.with_warehouse_url(url);
    }
    if let Some(url) = executor_url {
        config = config.with_executor_base_url(url);
    }

    config.validate()?;
    Ok(config)
}

/// Loads the entity catalog from a YAML file, or the built-in default.
fn load_catalog(path: Option<&str>) -> anyhow::Result<EntityCatalog> {
    match path {
        Some(path) => {
            let catalog = EntityCatalog::from_yaml_file(path)?;
            info!(
                path = path,
                group = %catalog.group,
                entities = catalog.entities.len(),
                "Loaded entity catalog"
            );
            Ok(catalog)
        }
        None => {
            info!("No catalog file given; using the built-in customer360 catalog");
            Ok(EntityCatalog::example())
        }
    }
}

/// Connects to the control-plane database, requiring a URL from flag or env.
async fn connect_store(database_url: Option<String>) -> anyhow::Result<Database> {
    let Some(url) = database_url else {
        anyhow::bail!(
            "DATABASE_URL is required but not set.\n\
             Provide it via --database-url <URL> or set the DATABASE_URL environment variable."
        );
    };
    Ok(Database::connect(&url).await?)
}

fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid date '{}': expected YYYY-MM-DD", raw))
}

fn parse_status(raw: &str) -> anyhow::Result<RunStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "running" => Ok(RunStatus::Running),
        "succeeded" => Ok(RunStatus::Succeeded),
        "failed" => Ok(RunStatus::Failed),
        "quarantined" => Ok(RunStatus::Quarantined),
        other => Err(anyhow::anyhow!(
            "Invalid status '{}': expected running, succeeded, failed, or quarantined",
            other
        )),
    }
}

fn print_run(run: &PipelineRun, json: bool) -> anyhow::Result<()> {
    let output = RunOutput::from_run(run);
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let duration = output
        .duration_secs
        .map(|secs| format!("{secs:.1}s"))
        .unwrap_or_else(|| "-".to_string());
    println!("\n=== Run {} ===", output.run_id);
    println!("Group:       {}", output.entity_group);
    println!("Date:        {}", output.process_date);
    println!("Environment: {}", output.environment);
    println!("Status:      {}", output.status);
    println!("Duration:    {}", duration);
    if let Some(error) = &output.error {
        println!("Error:       {}", error);
    }
    println!();
    for stage in &output.stages {
        println!(
            "  {:<22} {:<9} attempts={} in={} out={}",
            stage.stage,
            stage.status.to_string(),
            stage.attempts,
            stage.records_in,
            stage.records_out,
        );
        if let Some(error) = &stage.error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}
