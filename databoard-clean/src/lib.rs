//! Library module for databoard-clean.
//!
//! Argument parsing and command implementations live here so they can be
//! tested; `main.rs` only wires logging, signals and exit codes.

pub mod export;
pub mod source;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use databoard_core::{
    AuditReport, CleaningConfig, Pipeline, Result, RunStatus, catalog, redact_database_url,
};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use export::{ExportFormat, REPORT_FILE};
use source::DataSource;

/// CLI argument structure
#[derive(Debug, Parser)]
#[command(name = "databoard-clean")]
#[command(about = "Data-quality reconciliation for DataBoard e-commerce datasets")]
#[command(version)]
#[command(long_about = "
DataBoard Clean - e-commerce data reconciliation

Removes invalid, duplicate and orphaned records from the customers, products,
orders, order_items and payments collections, then writes cleaned extracts
and a data quality report describing every change.

INPUTS:
- A directory with one <collection>.json array per collection
- A SQLite database (sqlite:// URL or .db/.sqlite file), cleaned in place

EXAMPLES:
  databoard-clean run ./dataset --output-dir ./cleaned
  databoard-clean run sqlite://./shop.db --format csv --strict
  databoard-clean plan --reference-date 2024-01-01
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Clean a dataset and write extracts plus the quality report
    Run(RunArgs),
    /// Print the resolved execution plan without touching data
    Plan(PlanArgs),
    /// List the cleaning rules with their justifications
    Rules(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    pub quiet: bool,

    /// Log as JSON
    #[arg(long, global = true, help = "Emit log events as JSON lines")]
    pub log_json: bool,
}

/// Configuration file and per-value overrides
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// JSON configuration file
    #[arg(long, env = "DATABOARD_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Date treated as today by date rules
    #[arg(long, env = "DATABOARD_REFERENCE_DATE", value_name = "YYYY-MM-DD")]
    pub reference_date: Option<NaiveDate>,

    /// Per-rule timeout in seconds
    #[arg(long, env = "DATABOARD_RULE_TIMEOUT", value_name = "SECS")]
    pub rule_timeout: Option<u64>,

    /// Largest number of rules run at the same time
    #[arg(long, env = "DATABOARD_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    /// Days after the reference date before an order counts as future-dated
    #[arg(long)]
    pub grace_days: Option<i64>,

    /// Largest plausible item quantity
    #[arg(long)]
    pub max_quantity: Option<i64>,

    /// Largest plausible item unit price
    #[arg(long)]
    pub max_unit_price: Option<f64>,

    /// Days without sales before a product is archived
    #[arg(long)]
    pub inactivity_days: Option<i64>,

    /// Orders whose items add up to less than this are test orders
    #[arg(long, value_name = "AMOUNT")]
    pub min_order_total: Option<f64>,

    /// Keep orders that have no items
    #[arg(long)]
    pub keep_orders_without_items: bool,
}

impl ConfigArgs {
    /// Loads the configuration file, if any, and applies the overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be loaded or the result is invalid.
    pub fn load(&self) -> Result<CleaningConfig> {
        let mut config = match &self.config {
            Some(path) => CleaningConfig::from_json_file(path)?,
            None => CleaningConfig::default(),
        };
        if let Some(date) = self.reference_date {
            config = config.with_reference_date(date);
        }
        if let Some(secs) = self.rule_timeout {
            config.rule_timeout_secs = secs;
        }
        if let Some(limit) = self.max_concurrency {
            config = config.with_max_concurrency(limit);
        }
        if let Some(days) = self.grace_days {
            config = config.with_future_date_grace_days(days);
        }
        if let Some(quantity) = self.max_quantity {
            config = config.with_max_quantity(quantity);
        }
        if let Some(price) = self.max_unit_price {
            config = config.with_max_unit_price(price);
        }
        if let Some(days) = self.inactivity_days {
            config = config.with_product_inactivity_days(days);
        }
        if let Some(total) = self.min_order_total {
            config = config.with_min_order_total(total);
        }
        if self.keep_orders_without_items {
            config = config.with_require_order_items(false);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Dataset directory or SQLite database
    #[arg(env = "DATABOARD_INPUT", help = "Dataset directory or SQLite connection string")]
    pub input: String,

    /// Directory for extracts and the report
    #[arg(short, long, default_value = "cleaned", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Extract format
    #[arg(long, value_enum, default_value_t = ExportFormat::Both)]
    pub format: ExportFormat,

    /// Fail on any residual integrity violation or skipped rule
    #[arg(long)]
    pub strict: bool,

    #[command(flatten)]
    pub config: ConfigArgs,
}

impl RunArgs {
    /// Input name safe for logs and error messages.
    pub fn input_label(&self) -> String {
        if std::path::Path::new(&self.input).is_dir() {
            self.input.clone()
        } else {
            redact_database_url(&self.input)
        }
    }
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Result of a `run` command
#[derive(Debug)]
pub struct RunOutcome {
    pub report: AuditReport,
    pub report_path: PathBuf,
    pub exports: Vec<PathBuf>,
}

/// Cleans the dataset named by `args` and writes the report and extracts.
///
/// The data source is closed whether or not the run succeeds.
///
/// # Errors
/// Returns error for configuration problems, an unreadable input, or output
/// that cannot be written. Rule failures are reported, not returned.
pub async fn run_clean(args: &RunArgs, cancel: CancellationToken) -> Result<RunOutcome> {
    let config = args.config.load()?;
    let pipeline = catalog::pipeline(&config)?;
    let source = DataSource::open(&args.input, catalog::schemas()).await?;

    let outcome = clean_source(&pipeline, &source, args, cancel).await;
    source.close().await;
    outcome
}

async fn clean_source(
    pipeline: &Pipeline,
    source: &DataSource,
    args: &RunArgs,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let store = source.store();
    let report = pipeline.run_with_cancel(store, cancel).await?;

    let exports = if args.format == ExportFormat::ReportOnly {
        Vec::new()
    } else {
        export::export_collections(store, &args.output_dir, args.format).await?
    };

    std::fs::create_dir_all(&args.output_dir).map_err(|e| databoard_core::ReconcileError::Io {
        context: format!("Failed to create {}", args.output_dir.display()),
        source: e,
    })?;
    let report_path = args.output_dir.join(REPORT_FILE);
    export::write_report(&report_path, &report)?;
    info!("Report written to {}", report_path.display());

    Ok(RunOutcome {
        report,
        report_path,
        exports,
    })
}

/// Process exit code for a finished run.
///
/// `1` when any rule failed; under `--strict`, `2` when the run was partial
/// or left integrity violations behind; otherwise `0`.
pub fn exit_code(report: &AuditReport, strict: bool) -> i32 {
    if report.status == RunStatus::Failed {
        return 1;
    }
    if strict {
        if report.status != RunStatus::Succeeded {
            warn!("Run was not complete: {:?}", report.status);
            return 2;
        }
        if let Err(e) = report.ensure_consistent() {
            warn!("{}", e);
            return 2;
        }
    }
    0
}

/// One-screen summary of a run.
pub fn summarize(outcome: &RunOutcome) -> String {
    let report = &outcome.report;
    let mut out = String::new();
    let _ = writeln!(out, "Run {} finished: {:?}", report.run_id, report.status);
    for op in &report.operations {
        let _ = writeln!(
            out,
            "  {:<34} {:>7} -> {:<7} removed {:>6} ({:.2}%)",
            op.rule_id, op.before, op.after, op.removed, op.removal_rate
        );
    }
    for failed in &report.failed_rules {
        let _ = writeln!(out, "  FAILED  {}: {}", failed.rule_id, failed.error);
    }
    for skipped in &report.skipped_rules {
        let _ = writeln!(out, "  SKIPPED {}: {}", skipped.rule_id, skipped.reason);
    }
    let _ = writeln!(out, "Total removed: {}", report.total_removed);
    for (metric, value) in &report.data_quality_metrics {
        let _ = writeln!(out, "  {:<34} {:.2}%", metric, value);
    }
    let _ = writeln!(
        out,
        "Residual integrity violations: {}",
        report.residual_violations()
    );
    let _ = writeln!(out, "Report: {}", outcome.report_path.display());
    out
}

/// Renders the execution plan of the configured catalog.
///
/// # Errors
/// Returns error for an invalid configuration or rule set.
pub fn render_plan(args: &PlanArgs) -> Result<String> {
    let config = args.config.load()?;
    let pipeline = catalog::pipeline(&config)?;
    let plan = pipeline.plan();

    if args.json {
        return serde_json::to_string_pretty(plan).map_err(|e| {
            databoard_core::ReconcileError::Serialization {
                context: "Failed to serialize execution plan".to_string(),
                source: e,
            }
        });
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} rules, {} levels, at most {} concurrent, {}s per rule",
        plan.rule_count(),
        plan.levels.len(),
        pipeline.config().max_concurrency,
        pipeline.config().rule_timeout.as_secs()
    );
    for level in &plan.levels {
        let _ = writeln!(out, "Level {}", level.depth);
        for (i, batch) in level.batches.iter().enumerate() {
            let _ = writeln!(out, "  batch {}: {}", i + 1, batch.join(", "));
        }
    }
    Ok(out)
}

/// Lists the configured rules in declaration order.
///
/// # Errors
/// Returns error for an invalid configuration.
pub fn render_rules(args: &ConfigArgs) -> Result<String> {
    let config = args.load()?;
    let mut out = String::new();
    for rule in catalog::rules(&config) {
        let _ = writeln!(out, "{} [{}]", rule.id, rule.target);
        let _ = writeln!(out, "  {}", rule.action.describe());
        if !rule.depends_on.is_empty() {
            let _ = writeln!(out, "  after: {}", rule.depends_on.join(", "));
        }
        let _ = writeln!(out, "  why: {}", rule.justification);
    }
    Ok(out)
}
