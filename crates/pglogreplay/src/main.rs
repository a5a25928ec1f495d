//! pglogreplay - replay PostgreSQL query logs for statistics.
//!
//! `replay` re-executes the statements found in auto_explain JSON logs or
//! plain stderr logs under `EXPLAIN ANALYZE` and reports per-query costs.
//! `combine` merges several logs into one chronologically ordered stream.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pglogreplay_core::backend::postgres::{PostgresBackend, PostgresConfig};
use pglogreplay_core::backend::{Backend, OfflineBackend};
use pglogreplay_core::filter::QueryFilter;
use pglogreplay_core::fingerprint::NormalizingFingerprinter;
use pglogreplay_core::merge::{StreamMerger, write_merged};
use pglogreplay_core::record::RecordFormat;
use pglogreplay_core::report::{DEFAULT_TOP, RankKey, write_banner, write_ranking};
use pglogreplay_core::source::{LineWindow, LogSource};
use pglogreplay_core::stats::BudgetPolicy;
use pglogreplay_core::{CancelFlag, ReplayConfig, ReplayError, Replayer};

/// Replay PostgreSQL query logs against a live server.
#[derive(Parser)]
#[command(name = "pglogreplay", about = "Replay PostgreSQL query logs for statistics", version)]
struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay logged statements and report per-query plan statistics.
    Replay(ReplayArgs),
    /// Merge several logs into one stream ordered by timestamp.
    Combine(CombineArgs),
}

#[derive(clap::Args)]
struct ReplayArgs {
    /// Log files to replay. Several files are merged by timestamp first.
    #[arg(required = true)]
    log_files: Vec<PathBuf>,

    /// Log format: json (auto_explain) or stderr (plain text).
    #[arg(short, long, default_value = "stderr")]
    format: RecordFormat,

    /// Ignore records starting on or before this line.
    #[arg(long)]
    skip_lines: Option<u64>,

    /// Ignore records starting after this line.
    #[arg(long)]
    max_lines: Option<u64>,

    /// Execute each distinct query at most this many times.
    #[arg(long)]
    max_executions_per_query: Option<u64>,

    /// What consumes the execution budget: attempts or successes.
    #[arg(long, default_value = "attempts")]
    budget_policy: BudgetPolicy,

    /// Only count occurrences; never connect to the database.
    #[arg(long)]
    count_only: bool,

    /// Rankings to print after the replay (cost, count, time).
    #[arg(long, value_delimiter = ',', default_value = "cost,count")]
    rank_by: Vec<RankKey>,

    /// Number of queries per ranking.
    #[arg(long, default_value_t = DEFAULT_TOP)]
    top: usize,

    /// Additionally skip statements matching this regex. Repeatable.
    #[arg(long, value_name = "REGEX")]
    exclude: Vec<String>,

    /// Database server host.
    #[arg(long, env = "PGHOST")]
    host: Option<String>,

    /// Database server port.
    #[arg(short, long, env = "PGPORT")]
    port: Option<u16>,

    /// Database name.
    #[arg(short, long, env = "PGDATABASE")]
    database: Option<String>,

    /// Database user.
    #[arg(short = 'U', long, env = "PGUSER")]
    user: Option<String>,

    /// Database password.
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// statement_timeout for replayed statements, in milliseconds.
    #[arg(long)]
    statement_timeout_ms: Option<u64>,

    /// Cancel the run after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(clap::Args)]
struct CombineArgs {
    /// Log files to merge.
    #[arg(required = true)]
    log_files: Vec<PathBuf>,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("pglogreplay={},pglogreplay_core={}", level, level))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Raise `cancel` on SIGINT/SIGTERM.
fn install_signal_handler(cancel: &CancelFlag) {
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.cancel();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }
}

/// Raise `cancel` once `timeout` has elapsed.
fn spawn_deadline(cancel: &CancelFlag, timeout: Duration) {
    let flag = cancel.clone();
    thread::spawn(move || {
        thread::sleep(timeout);
        if !flag.is_cancelled() {
            warn!(timeout_secs = timeout.as_secs(), "run timed out, cancelling");
            flag.cancel();
        }
    });
}

/// Build the backend, exiting with usage text if connection options are missing.
fn build_backend(args: &ReplayArgs, cancel: &CancelFlag) -> Box<dyn Backend> {
    if args.count_only {
        return Box::new(OfflineBackend);
    }

    let missing: Vec<&str> = [
        ("--host (PGHOST)", args.host.is_none()),
        ("--port (PGPORT)", args.port.is_none()),
        ("--database (PGDATABASE)", args.database.is_none()),
        ("--user (PGUSER)", args.user.is_none()),
    ]
    .into_iter()
    .filter_map(|(name, absent)| absent.then_some(name))
    .collect();

    let (Some(host), Some(port), Some(database), Some(user)) =
        (&args.host, args.port, &args.database, &args.user)
    else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                format!(
                    "the following options are not set: {}\n\
                     Provide them or pass --count-only",
                    missing.join(", ")
                ),
            )
            .exit();
    };

    let config = PostgresConfig::new(host.as_str(), port, database.as_str(), user.as_str())
        .with_password(args.password.clone())
        .with_statement_timeout_ms(args.statement_timeout_ms);
    Box::new(PostgresBackend::new(config, cancel.clone()))
}

fn open_sources(paths: &[PathBuf]) -> Result<Vec<LogSource>> {
    paths
        .iter()
        .map(|path| LogSource::open(path).map_err(anyhow::Error::from))
        .collect()
}

fn run_replay(args: ReplayArgs) -> Result<()> {
    let cancel = CancelFlag::new();
    let backend = build_backend(&args, &cancel);

    let mut filter = QueryFilter::new();
    for pattern in &args.exclude {
        filter = filter
            .with_exclusion(pattern)
            .with_context(|| format!("invalid --exclude pattern '{}'", pattern))?;
    }

    let mut sources = open_sources(&args.log_files)?;

    install_signal_handler(&cancel);
    if let Some(secs) = args.timeout_secs {
        spawn_deadline(&cancel, Duration::from_secs(secs));
    }

    let config = ReplayConfig::new(args.format)
        .with_window(LineWindow::new(args.skip_lines, args.max_lines))
        .with_max_executions_per_query(args.max_executions_per_query)
        .with_budget_policy(args.budget_policy)
        .with_count_only(args.count_only)
        .with_filter(filter);

    info!(
        files = sources.len(),
        format = %args.format,
        count_only = args.count_only,
        budget_policy = %args.budget_policy,
        "starting replay"
    );

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    write_banner(&mut out, args.format, sources.len(), args.skip_lines)?;

    let mut replayer = Replayer::new(config, backend, NormalizingFingerprinter, &mut out, cancel);
    let result = if sources.len() == 1 {
        replayer.replay_lines(sources.remove(0))
    } else {
        replayer.replay_merged(StreamMerger::new(sources))
    };
    let context = replayer.into_context();

    let cancelled = match result {
        Ok(_) => false,
        Err(ReplayError::Cancelled) => {
            warn!(
                processed = context.execution_number(),
                "replay cancelled, reporting partial results"
            );
            true
        }
        Err(e) => return Err(e).context("replay aborted"),
    };

    for key in &args.rank_by {
        write_ranking(&mut out, context.table(), *key, args.top)?;
    }
    out.flush()?;

    if cancelled {
        bail!(ReplayError::Cancelled);
    }
    Ok(())
}

fn run_combine(args: CombineArgs) -> Result<()> {
    let sources = open_sources(&args.log_files)?;
    let files = sources.len();

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let written = write_merged(StreamMerger::new(sources), &mut out)?;
    info!(files, lines = written, "logs combined");
    Ok(())
}

/// True when the error chain ends in a closed stdout.
fn is_broken_pipe(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|err| err.kind() == io::ErrorKind::BrokenPipe)
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    debug!("pglogreplay {} starting", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Replay(args) => run_replay(args),
        Command::Combine(args) => run_combine(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_broken_pipe(&e) => {
            debug!("stdout closed, stopping");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
