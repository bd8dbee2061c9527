//! `rl`: operator command surface over the run event log and its derived
//! index.
//!
//! [`run_cli`] executes a parsed [`Cli`]; JSON output goes to stdout and
//! diagnostics go to stderr through `tracing`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use runledger_core::{
    parse_rfc3339_utc, to_epoch_ms, AppendReceipt, Deadline, EventEmitter, EventType,
    EventWriter, LedgerConfig, LogLayout, NewEvent, PartitionKey,
};
use runledger_index_sqlite::{
    CutoverRouter, DaemonSummary, IndexCheck, IndexDaemon, IndexErrorRecord, IndexIssueSeverity,
    IndexStatus, Indexer, LegacyRunStore, PassReport, RunReadPort, SqliteDerivedStore, TimeRange,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Run event ledger and derived index")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./runledger/log")]
    log_root: PathBuf,

    #[arg(long, global = true, default_value = "./runledger/index.sqlite3")]
    db: PathBuf,

    /// JSON configuration file; flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Emit(EmitArgs),
    Index(IndexArgs),
    Daemon(DaemonArgs),
    Status(OutputArgs),
    Check(OutputArgs),
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    Errors {
        #[command(subcommand)]
        command: ErrorsCommand,
    },
}

#[derive(Debug, Args)]
pub struct EmitArgs {
    #[arg(long = "type")]
    event_type: String,
    #[arg(long)]
    run_id: Option<String>,
    /// Defaults to the latest registered version.
    #[arg(long)]
    schema_version: Option<u32>,
    /// RFC3339 UTC; defaults to now.
    #[arg(long)]
    occurred_at: Option<String>,
    #[arg(long, default_value = "{}")]
    payload_json: String,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct IndexArgs {
    /// Rescan from this partition day (YYYY-MM-DD) onward.
    #[arg(long, conflicts_with = "full")]
    since: Option<String>,
    #[arg(long)]
    full: bool,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DaemonArgs {
    /// Seconds between passes.
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long)]
    max_ticks: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct OutputArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    Show(RunIdArgs),
    Phases(RunIdArgs),
    Trials(RunIdArgs),
    List(RunsListArgs),
}

#[derive(Debug, Args)]
pub struct RunIdArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
pub struct RunsListArgs {
    /// RFC3339 UTC lower bound on creation time (inclusive).
    #[arg(long, requires = "to")]
    from: Option<String>,
    /// RFC3339 UTC upper bound on creation time (exclusive).
    #[arg(long, requires = "from")]
    to: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Pre-migration store consulted for runs created before the cutover.
    #[arg(long)]
    legacy_db: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ErrorsCommand {
    List(ErrorsListArgs),
}

#[derive(Debug, Args)]
pub struct ErrorsListArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `info`
/// default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Emit(args) => run_emit(&cli.log_root, &config, args),
        Command::Index(args) => run_index(&cli.log_root, &cli.db, &config, &args),
        Command::Daemon(args) => run_daemon(&cli.log_root, &cli.db, &config, &args),
        Command::Status(args) => {
            let status = Indexer::open_read_only(&cli.log_root, &cli.db, &config)?.status()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_index_status(&status);
            }
            Ok(())
        }
        Command::Check(args) => {
            let check = Indexer::open_read_only(&cli.log_root, &cli.db, &config)?.check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_index_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "index check failed: {}",
                    check
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
        Command::Runs { command } => run_runs(&cli.db, &config, command),
        Command::Errors { command } => match command {
            ErrorsCommand::List(args) => {
                let store = SqliteDerivedStore::open_read_only(&cli.db)?;
                let errors = store.index_errors(args.limit)?;
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&errors)?);
                } else {
                    print_index_errors(&errors);
                }
                Ok(())
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<LedgerConfig> {
    let Some(path) = path else {
        return Ok(LedgerConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("config must be valid JSON: {}", path.display()))?;
    Ok(LedgerConfig::from_json(&value)?)
}

fn run_emit(log_root: &Path, config: &LedgerConfig, args: EmitArgs) -> Result<()> {
    let event_type = EventType::parse(&args.event_type)
        .ok_or_else(|| anyhow!("unknown event type: {}", args.event_type))?;
    let payload: Value = serde_json::from_str(&args.payload_json)
        .with_context(|| format!("payload_json must be valid JSON: {}", args.payload_json))?;
    let writer = EventWriter::with_config(LogLayout::new(log_root), config)?;

    let receipt: AppendReceipt = if args.schema_version.is_none() && args.occurred_at.is_none() {
        let mut emitter = EventEmitter::new(Arc::new(writer));
        if let Some(timeout_ms) = args.timeout_ms {
            emitter = emitter.with_append_timeout(Duration::from_millis(timeout_ms));
        }
        emitter.emit(event_type, args.run_id.as_deref(), payload)?
    } else {
        let schema_version = match args.schema_version {
            Some(version) => version,
            None => writer
                .registry()
                .latest_version(event_type)
                .ok_or_else(|| anyhow!("no registered schema for {event_type}"))?,
        };
        let occurred_at_ms = match args.occurred_at.as_deref() {
            Some(raw) => to_epoch_ms(parse_rfc3339_utc(raw)?),
            None => runledger_core::now_epoch_ms(),
        };
        let input = NewEvent {
            event_type: event_type.as_str().to_string(),
            schema_version,
            occurred_at_ms,
            run_id: args.run_id,
            payload,
        };
        writer.append(&input, Deadline::from_timeout_ms(args.timeout_ms))?
    };

    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

fn run_index(log_root: &Path, db: &Path, config: &LedgerConfig, args: &IndexArgs) -> Result<()> {
    let since = args
        .since
        .as_deref()
        .map(PartitionKey::parse)
        .transpose()?;
    let deadline = Deadline::from_timeout_ms(args.timeout_ms.or(config.pass_timeout_ms));

    let mut indexer = Indexer::open(log_root, db, config)?;
    let report = if args.full {
        indexer.run_full_rebuild(deadline)?
    } else {
        indexer.run_incremental_pass(since, deadline)?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_pass_report(&report);
    }
    Ok(())
}

fn run_daemon(log_root: &Path, db: &Path, config: &LedgerConfig, args: &DaemonArgs) -> Result<()> {
    let interval_secs = args.interval.unwrap_or(config.daemon_interval_secs);
    if interval_secs == 0 {
        bail!("--interval MUST be >= 1");
    }

    let indexer = Indexer::open(log_root, db, config)?;
    let mut daemon = IndexDaemon::new(indexer, Duration::from_secs(interval_secs))
        .with_pass_timeout(config.pass_timeout_ms.map(Duration::from_millis));
    let summary = daemon.run(args.max_ticks);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_daemon_summary(&summary);
    }
    Ok(())
}

fn run_runs(db: &Path, config: &LedgerConfig, command: RunsCommand) -> Result<()> {
    let store = SqliteDerivedStore::open_read_only(db)?;
    match command {
        RunsCommand::Show(args) => {
            let run = store
                .run(&args.run_id)?
                .ok_or_else(|| anyhow!("run not found: {}", args.run_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        RunsCommand::Phases(args) => {
            let phases = store.phases(&args.run_id)?;
            println!("{}", serde_json::to_string_pretty(&phases)?);
        }
        RunsCommand::Trials(args) => {
            let trials = store.trials(&args.run_id)?;
            println!("{}", serde_json::to_string_pretty(&trials)?);
        }
        RunsCommand::List(args) => {
            let range = match (args.from.as_deref(), args.to.as_deref()) {
                (Some(from), Some(to)) => Some(TimeRange::new(
                    to_epoch_ms(parse_rfc3339_utc(from)?),
                    to_epoch_ms(parse_rfc3339_utc(to)?),
                )?),
                _ => None,
            };
            let mut runs = match (range, args.legacy_db.as_deref()) {
                (Some(range), Some(legacy_db)) => {
                    let legacy = LegacyRunStore::open(legacy_db)?;
                    CutoverRouter::new(legacy, store, config.legacy_cutover_ms)
                        .runs_in_range(range)?
                }
                (Some(range), None) => store.runs_in_range(range)?,
                (None, _) => store.latest_runs(args.limit)?,
            };
            runs.truncate(args.limit);
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
    }
    Ok(())
}

fn print_pass_report(report: &PassReport) {
    println!(
        "contract={} pass_id={} mode={} since={}",
        report.contract_version,
        report.pass_id,
        report.mode.as_str(),
        report.since.as_deref().unwrap_or("n/a")
    );
    let stats = &report.stats;
    println!(
        "events_seen={} applied={} skipped={} duplicates={} superseded={} out_of_order={} errors={} resolved={} corrupt_records={} bytes_scanned={}",
        stats.events_seen,
        stats.applied,
        stats.skipped,
        stats.duplicates,
        stats.superseded,
        stats.out_of_order,
        stats.errors,
        stats.resolved,
        stats.corrupt_records,
        stats.bytes_scanned
    );
    for sample in &stats.error_samples {
        println!("error: {sample}");
    }
}

fn print_index_status(status: &IndexStatus) {
    println!(
        "contract={} last_partition_indexed={} last_sequence_no={} last_offset_indexed={} segments={}/{} pending_bytes={} torn_tail_bytes={}",
        status.contract_version,
        status.last_partition_indexed.as_deref().unwrap_or("n/a"),
        status.last_sequence_no,
        status.last_offset_indexed,
        status.segments_tracked,
        status.segments_total,
        status.pending_bytes,
        status.torn_tail_bytes
    );
    let counts = &status.counts;
    println!(
        "runs={} phases={} trials={} artifacts={} applied_events={} index_errors={} unresolved_run_references={} out_of_order_phases={}",
        counts.runs,
        counts.phases,
        counts.trials,
        counts.artifacts,
        counts.applied_events,
        counts.index_errors,
        counts.unresolved_run_references,
        counts.out_of_order_phases
    );
    match &status.last_pass {
        Some(pass) => println!(
            "last_pass={} mode={} finished_at={}",
            pass.pass_id,
            pass.mode.as_str(),
            pass.finished_at
        ),
        None => println!("last_pass=n/a"),
    }
    if let Some(lease) = &status.lease {
        println!(
            "lease_holder={} lease_expires_at_ms={} lease_expired={}",
            lease.holder, lease.expires_at_ms, status.lease_expired
        );
    }
}

fn print_index_check(check: &IndexCheck) {
    println!("contract={}", check.contract_version);
    print_index_status(&check.status);
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    IndexIssueSeverity::Warning => "warning",
                    IndexIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>();
        println!("issues={}", formatted.join(" | "));
    }
}

fn print_index_errors(errors: &[IndexErrorRecord]) {
    println!(
        "{:<28} {:<16} {:<18} {:<22} {:<20} message",
        "event_id", "event_type", "code", "segment", "run_id"
    );
    println!("{}", "-".repeat(120));
    for error in errors {
        let location = format!("{}@{}", error.segment, error.offset);
        println!(
            "{:<28} {:<16} {:<18} {:<22} {:<20} {}",
            error.event_id,
            error.event_type,
            error.code,
            location,
            error.run_id.as_deref().unwrap_or("-"),
            error.message
        );
    }
}

fn print_daemon_summary(summary: &DaemonSummary) {
    println!(
        "ticks={} passes={} lease_busy={} failures={} events_applied={}",
        summary.ticks, summary.passes, summary.lease_busy, summary.failures, summary.events_applied
    );
}
