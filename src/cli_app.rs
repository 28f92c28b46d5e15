//! Top-level CLI definition and dispatch.

use std::collections::HashSet;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use bitrot_sentinel::core::config::Config;
use bitrot_sentinel::core::errors::BrsError;
use bitrot_sentinel::core::paths::{absolute_path, resolve_absolute_path};
use bitrot_sentinel::core::signals::SignalHandler;
use bitrot_sentinel::logger::activity::{
    ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use bitrot_sentinel::logger::jsonl::JsonlConfig;
use bitrot_sentinel::scanner::engine::{
    ScanContext, ScanReport, ScanSettings, accept_baseline, run_scan as run_verification,
};
use bitrot_sentinel::scanner::hasher::Sha256Hasher;
use bitrot_sentinel::scanner::inventory::InventoryConfig;
use bitrot_sentinel::scanner::progress::{PruneProgress, ScanProgress};
use bitrot_sentinel::scanner::prune::{PathPattern, PruneReport, Pruner};
use bitrot_sentinel::scanner::watchdog::WatchdogSettings;
use bitrot_sentinel::store::{BaselineStore, RetryPolicy, SharedStore, shared};

/// Bitrot Sentinel: flags files whose content changed while their mtime did not.
#[derive(Debug, Parser)]
#[command(
    name = "brs",
    author,
    version,
    about = "Bitrot Sentinel - silent data corruption detector",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Quiet mode (only critical notices on stderr).
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Show a live progress line on stderr.
    #[arg(long, global = true)]
    progress: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Hash every file under a tree and compare against the baseline.
    Scan(ScanArgs),
    /// Drop baseline records whose file no longer exists.
    Prune(PruneArgs),
    /// Accept the current content of an alerted file as its new baseline.
    Accept(AcceptArgs),
    /// Show baseline iteration and record count.
    Status(StatusArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct ScanArgs {
    /// Root of the tree to verify (default: scan.start_path, `/`).
    #[arg(value_name = "START_PATH")]
    start_path: Option<PathBuf>,
    /// Baseline database (default: store.db_file, `data.db`).
    #[arg(value_name = "DB_FILE")]
    db_file: Option<PathBuf>,
    /// Use paths as walked instead of resolving them.
    #[arg(long)]
    skip_realpath: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct PruneArgs {
    /// Path glob selecting records to check (`*`, `**`, `?`, `[a-z]`, `[!x]`).
    #[arg(value_name = "PATTERN")]
    pattern: Option<String>,
    /// Baseline database.
    #[arg(value_name = "DB_FILE")]
    db_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct AcceptArgs {
    /// File whose current content becomes the baseline.
    #[arg(value_name = "PATH")]
    path: PathBuf,
    /// Baseline database (default: store.db_file).
    #[arg(value_name = "DB_FILE")]
    db_file: Option<PathBuf>,
    /// Use the path as given instead of resolving it.
    #[arg(long)]
    skip_realpath: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct StatusArgs {
    /// Baseline database (default: store.db_file).
    #[arg(value_name = "DB_FILE")]
    db_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Operation stopped before it finished.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<BrsError> for CliError {
    fn from(err: BrsError) -> Self {
        if err.is_retryable() {
            Self::Runtime(err.to_string())
        } else {
            Self::User(err.to_string())
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Scan(args) => run_scan(cli, args),
        Command::Prune(args) => run_prune(cli, args),
        Command::Accept(args) => run_accept(cli, args),
        Command::Status(args) => run_status(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── shared plumbing ────────────────────

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn open_store(
    config: &Config,
    db_file: &Path,
    logger: &ActivityLoggerHandle,
) -> Result<SharedStore, CliError> {
    let retry = RetryPolicy {
        attempts: config.store.open_retries,
        backoff: Duration::from_millis(config.store.retry_backoff_ms),
    };
    let store = BaselineStore::open_logged(
        db_file,
        retry,
        Duration::from_millis(config.store.busy_timeout_ms),
        logger.clone(),
    )?;
    Ok(shared(store))
}

/// Logger thread plus the handle to stop it.
struct RunningLogger {
    handle: ActivityLoggerHandle,
    join: thread::JoinHandle<()>,
}

impl RunningLogger {
    fn start(cli: &Cli, config: &Config) -> Result<Self, CliError> {
        let mut logger_config =
            ActivityLoggerConfig::new(JsonlConfig::at(config.paths.jsonl_log.clone()));
        logger_config.quiet = cli.quiet;
        let (handle, join) = spawn_logger(logger_config)?;
        Ok(Self { handle, join })
    }

    /// Open the baseline with transient-failure retries reported through
    /// this logger.
    fn open_store(&self, config: &Config, db_file: &Path) -> Result<SharedStore, CliError> {
        open_store(config, db_file, &self.handle)
    }

    fn stop(self) {
        self.handle.shutdown();
        let _ = self.join.join();
    }
}

/// Background stderr progress line, redrawn until stopped.
struct ProgressReporter {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl ProgressReporter {
    fn start<F>(enabled: bool, render: F) -> Self
    where
        F: Fn() -> String + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        if !enabled {
            return Self { stop, join: None };
        }
        let flag = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("brs-progress".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let mut stderr = io::stderr().lock();
                    let _ = write!(stderr, "\r\x1b[2K{}", render());
                    let _ = stderr.flush();
                    drop(stderr);
                    thread::sleep(Duration::from_millis(250));
                }
                eprintln!();
            })
            .ok();
        Self { stop, join }
    }

    fn finish(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ──────────────────── scan ────────────────────

fn run_scan(cli: &Cli, args: &ScanArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let start_path = absolute_path(
        args.start_path
            .as_deref()
            .unwrap_or(config.scan.start_path.as_path()),
    );
    let db_file = args
        .db_file
        .clone()
        .unwrap_or_else(|| config.store.db_file.clone());
    let canonicalize = !(args.skip_realpath || config.scan.skip_realpath);

    let logger = RunningLogger::start(cli, &config)?;
    let store = match logger.open_store(&config, &db_file) {
        Ok(store) => store,
        Err(err) => {
            logger.stop();
            return Err(err);
        }
    };
    let progress = ScanProgress::new();

    let ctx = ScanContext {
        store,
        hasher: Arc::new(Sha256Hasher::new(config.scan.chunk_size_bytes)),
        logger: logger.handle.clone(),
        progress: Arc::clone(&progress),
        signals: SignalHandler::install(),
    };
    let settings = ScanSettings {
        inventory: InventoryConfig {
            root: start_path,
            canonicalize,
            parallelism: config.scan.parallelism,
            cross_devices: config.scan.cross_devices,
            excluded_paths: config
                .scan
                .excluded_paths
                .iter()
                .cloned()
                .collect::<HashSet<_>>(),
        },
        watchdog: WatchdogSettings::from(&config.watchdog),
        config_hash: config.stable_hash().ok(),
    };

    let reporter = ProgressReporter::start(cli.progress, move || {
        let snap = progress.snapshot();
        format!(
            "[BRS-PROGRESS] {}/{} files, {}/{}, {} alert(s)",
            snap.files_processed,
            snap.total_files,
            format_bytes(snap.bytes_processed),
            format_bytes(snap.total_bytes),
            snap.alerts,
        )
    });
    let outcome = run_verification(&ctx, &settings);
    reporter.finish();
    logger.stop();

    let report = outcome?;
    match output_mode(cli) {
        OutputMode::Human => print_scan_human(&report, &db_file),
        OutputMode::Json => write_json_line(&json!({
            "command": "scan",
            "db_file": db_file,
            "report": report,
        }))?,
    }

    if report.interrupted {
        return Err(CliError::Partial(
            "scan interrupted; unprocessed files keep their previous baseline".to_string(),
        ));
    }
    Ok(())
}

fn print_scan_human(report: &ScanReport, db_file: &Path) {
    println!(
        "{}\n  Root: {}\n  Baseline: {} (iteration {})\n  Files: {} of {} ({}) in {}",
        "Bitrot Scan Results".bold(),
        report.root.display(),
        db_file.display(),
        report.iteration,
        report.files_processed,
        report.total_files,
        format_bytes(report.bytes_processed),
        format_duration(Duration::from_millis(report.duration_ms)),
    );
    println!(
        "  New: {}  Updated: {}  Matching: {}  Skipped: {}",
        report.new_records, report.updated_records, report.matching_records, report.skipped,
    );

    if report.alerts.is_empty() {
        println!("  {}", "No corruption detected.".green());
    } else {
        println!(
            "\n  {}",
            format!("CORRUPTION ALERTS: {}", report.alerts.len()).red().bold()
        );
        for alert in &report.alerts {
            println!("    {}", alert.path.red());
            println!("      baseline: {}", alert.expected_hash);
            println!("      current:  {}", alert.actual_hash);
            println!("      mtime:    {} (unchanged)", alert.mtime.to_rfc3339());
        }
        println!("\n  Review each file, then run `brs accept PATH` to take its new content.");
    }

    if !report.retried.is_empty() || !report.stall_skipped.is_empty() {
        println!(
            "\n  {} {} retried after a stall, {} skipped",
            "Watchdog:".yellow(),
            report.retried.len(),
            report.stall_skipped.len(),
        );
        for path in &report.stall_skipped {
            println!("    skipped: {}", path.display());
        }
    }
    if report.interrupted {
        println!("\n  {}", "Interrupted before the queue was drained.".yellow());
    }
}

// ──────────────────── prune ────────────────────

fn run_prune(cli: &Cli, args: &PruneArgs) -> Result<(), CliError> {
    let (Some(pattern), Some(db_file)) = (&args.pattern, &args.db_file) else {
        eprintln!("[BRS-PRUNE] usage: brs prune PATTERN DB_FILE (nothing pruned)");
        return Ok(());
    };
    let pattern = PathPattern::new(pattern)?;

    let config = load_config(cli)?;
    let logger = RunningLogger::start(cli, &config)?;
    let store = match logger.open_store(&config, db_file) {
        Ok(store) => store,
        Err(err) => {
            logger.stop();
            return Err(err);
        }
    };
    let progress = PruneProgress::new();
    let pruner = Pruner::new(store, logger.handle.clone(), Arc::clone(&progress));

    let reporter = ProgressReporter::start(cli.progress, move || {
        let snap = progress.snapshot();
        format!(
            "[BRS-PROGRESS] {}/{} records checked, {} pruned",
            snap.processed, snap.total, snap.pruned
        )
    });
    let outcome = pruner.prune(&pattern, &SignalHandler::install());
    reporter.finish();
    logger.stop();

    let report = outcome?;
    match output_mode(cli) {
        OutputMode::Human => print_prune_human(&report),
        OutputMode::Json => write_json_line(&json!({
            "command": "prune",
            "db_file": db_file,
            "report": report,
        }))?,
    }
    if report.interrupted {
        return Err(CliError::Partial("prune interrupted".to_string()));
    }
    Ok(())
}

fn print_prune_human(report: &PruneReport) {
    println!(
        "{}\n  Pattern: {}\n  Matched: {}  Pruned: {}",
        "Baseline Prune".bold(),
        report.pattern,
        report.matched,
        report.pruned_count(),
    );
    for path in &report.pruned {
        println!("    {} {path}", "-".red());
    }
    if report.unverifiable > 0 {
        println!(
            "  {} {} record(s) kept because their path could not be checked",
            "Note:".yellow(),
            report.unverifiable
        );
    }
}

// ──────────────────── accept ────────────────────

fn run_accept(cli: &Cli, args: &AcceptArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let path = if args.skip_realpath || config.scan.skip_realpath {
        absolute_path(&args.path)
    } else {
        std::fs::canonicalize(&args.path)
            .map_err(|e| CliError::User(format!("{}: {e}", args.path.display())))?
    };
    let db_file = args
        .db_file
        .clone()
        .unwrap_or_else(|| config.store.db_file.clone());

    let logger = RunningLogger::start(cli, &config)?;
    let store = match logger.open_store(&config, &db_file) {
        Ok(store) => store,
        Err(err) => {
            logger.stop();
            return Err(err);
        }
    };
    let hasher = Sha256Hasher::new(config.scan.chunk_size_bytes);
    let outcome = accept_baseline(&store, &hasher, &logger.handle, &path);
    logger.stop();

    let record = outcome.map_err(|e| CliError::User(e.to_string()))?;
    match output_mode(cli) {
        OutputMode::Human => println!(
            "{} {}\n  hash:  {}\n  mtime: {}",
            "Accepted".green().bold(),
            record.path,
            record.content_hash,
            record.mtime.to_rfc3339(),
        ),
        OutputMode::Json => write_json_line(&json!({
            "command": "accept",
            "path": record.path,
            "content_hash": record.content_hash,
            "mtime": record.mtime,
            "iteration": record.iteration,
        }))?,
    }
    Ok(())
}

// ──────────────────── status ────────────────────

fn run_status(cli: &Cli, args: &StatusArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let db_file = args
        .db_file
        .clone()
        .unwrap_or_else(|| config.store.db_file.clone());

    let payload = if db_file.exists() {
        // Status never writes the activity log.
        let store = open_store(&config, &db_file, &ActivityLoggerHandle::disconnected())?;
        let guard = store.lock();
        json!({
            "command": "status",
            "db_file": resolve_absolute_path(&db_file),
            "exists": true,
            "iteration": guard.iteration()?,
            "records": guard.count()?,
        })
    } else {
        json!({
            "command": "status",
            "db_file": absolute_path(&db_file),
            "exists": false,
            "iteration": 0,
            "records": 0,
        })
    };

    match output_mode(cli) {
        OutputMode::Human => print_status_human(&payload),
        OutputMode::Json => write_json_line(&payload)?,
    }
    Ok(())
}

fn print_status_human(payload: &Value) {
    let db = payload["db_file"].as_str().unwrap_or("?");
    if payload["exists"].as_bool() == Some(true) {
        println!(
            "{}\n  Baseline: {db}\n  Iteration: {}\n  Records: {}",
            "Bitrot Sentinel Status".bold(),
            payload["iteration"],
            payload["records"],
        );
    } else {
        println!(
            "{}\n  Baseline: {db} {}",
            "Bitrot Sentinel Status".bold(),
            "(not created yet)".yellow(),
        );
    }
}

// ──────────────────── output helpers ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("BRS_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    if bytes >= TIB {
        format!("{:.1} TB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
