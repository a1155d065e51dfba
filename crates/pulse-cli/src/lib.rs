//! Command surface for the `pulse` binary.

#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use pulse_bench::{
    BenchmarkConfig, BenchmarkReport, Profile, ScenarioLibrary, StageEvent, render_stage,
    render_stage_header, render_summary, run_benchmark_with,
};
use pulse_core::{Config, ConfigError, DailyCount, PointCounters, SystemClock};
use pulse_db::{
    AnalyticsCache, Backend, CacheSettings, DOWNLOADS, DbError, MemoryBackend, RELEASES,
    RestBackend, Row, download_row, reset_downloads,
};

/// Simulated per-operation latency of the `--sandbox` backend.
const SANDBOX_LATENCY: Duration = Duration::from_millis(2);
/// Downloads pre-seeded into the sandbox so `stats` has something to show.
const SANDBOX_DOWNLOADS: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// 2 for configuration and usage problems, 1 for runtime failures.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::InvalidArgument(_) => 2,
            Self::Db(_) | Self::Json(_) | Self::Io(_) => 1,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    version,
    about = "Download Pulse load tester and analytics CLI"
)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Defaults to `bench` with the mixed profile.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the staged load test.
    Bench(BenchArgs),
    /// Print the download counters and the 30-day history.
    Stats {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        sandbox: bool,
    },
    /// Delete every tracked download.
    Reset {
        /// Required; the deletion cannot be undone.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        sandbox: bool,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct BenchArgs {
    #[arg(long, value_enum, default_value_t = ProfileArg::Mixed)]
    pub profile: ProfileArg,
    /// Print the run as JSON instead of the text report.
    #[arg(long)]
    pub json: bool,
    /// Run against the in-memory backend.
    #[arg(long)]
    pub sandbox: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProfileArg {
    #[default]
    Mixed,
    Write,
}

impl From<ProfileArg> for Profile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Mixed => Self::Mixed,
            ProfileArg::Write => Self::Write,
        }
    }
}

/// Install the stderr `fmt` subscriber. Safe to call more than once.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

pub fn run() -> i32 {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let result = Config::from_env()
        .map_err(CliError::from)
        .and_then(|config| execute(cli, &config, &mut io::stdout().lock()));
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}

/// Dispatch one parsed command, writing its report to `out`.
pub fn execute(cli: Cli, config: &Config, out: &mut dyn Write) -> CliResult<()> {
    match cli
        .command
        .unwrap_or_else(|| Commands::Bench(BenchArgs::default()))
    {
        Commands::Bench(args) => handle_bench(&args, config, out),
        Commands::Stats { json, sandbox } => handle_stats(json, sandbox, config, out),
        Commands::Reset { yes, sandbox } => handle_reset(yes, sandbox, config, out),
    }
}

fn open_backend(config: &Config, sandbox: bool) -> CliResult<Arc<dyn Backend>> {
    if sandbox {
        tracing::debug!("using in-memory sandbox backend");
        return Ok(Arc::new(sandbox_backend()));
    }
    let settings = config.connection()?;
    tracing::debug!(url = %settings.url, "using REST backend");
    Ok(Arc::new(RestBackend::new(&settings)))
}

/// In-memory backend with one release and a few downloads from today.
#[must_use]
pub fn sandbox_backend() -> MemoryBackend {
    let backend = MemoryBackend::new().with_latency(SANDBOX_LATENCY);
    let mut release = Row::new();
    release.insert("version".to_string(), Value::from("sandbox"));
    backend.seed(RELEASES, [release]);
    let release_id = backend
        .rows(RELEASES)
        .into_iter()
        .next()
        .and_then(|mut row| row.remove("id"));
    backend.seed(
        DOWNLOADS,
        (0..SANDBOX_DOWNLOADS).map(|_| download_row(release_id.as_ref())),
    );
    backend
}

fn handle_bench(args: &BenchArgs, config: &Config, out: &mut dyn Write) -> CliResult<()> {
    let bench = BenchmarkConfig::for_profile(args.profile.into()).with_overrides(config);
    bench.validate()?;
    let backend = open_backend(config, args.sandbox)?;
    let library = ScenarioLibrary::new(backend, Arc::new(SystemClock));

    let mut write_err: Option<io::Error> = None;
    let json = args.json;
    let results = run_benchmark_with(&bench, &library, |event| {
        if json || write_err.is_some() {
            return;
        }
        let text = match event {
            StageEvent::Starting { concurrency, .. } => {
                format!("\n{}", render_stage_header(concurrency))
            }
            StageEvent::Finished(result) => render_stage(result),
        };
        if let Err(err) = writeln!(out, "{}", text.trim_end()).and_then(|()| out.flush()) {
            write_err = Some(err);
        }
    })?;
    if let Some(err) = write_err {
        return Err(err.into());
    }

    if json {
        let report = BenchmarkReport {
            config: &bench,
            stages: &results,
        };
        writeln!(out, "{}", report.to_json()?)?;
    } else {
        writeln!(out, "\nSummary ({} profile)", bench.profile.as_str())?;
        write!(out, "{}", render_summary(&results))?;
    }
    Ok(())
}

/// JSON shape of `pulse stats --json`.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub counters: PointCounters,
    pub history: Vec<DailyCount>,
}

/// Text rendering of the counters followed by one line per history day.
#[must_use]
pub fn render_stats(counters: &PointCounters, history: &[DailyCount]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Total downloads: {}", counters.total);
    let _ = writeln!(out, "Today: {}", counters.today);
    let _ = writeln!(out, "This week: {}", counters.week);
    let _ = writeln!(out, "This month: {}", counters.month);
    let _ = writeln!(out, "History ({} days):", history.len());
    for day in history {
        let _ = writeln!(out, "  {}  {:>6}", day.date, day.count);
    }
    out
}

fn handle_stats(json: bool, sandbox: bool, config: &Config, out: &mut dyn Write) -> CliResult<()> {
    let backend = open_backend(config, sandbox)?;
    let cache = AnalyticsCache::new(
        backend,
        Arc::new(SystemClock),
        CacheSettings::from_config(config),
    );
    let report = StatsReport {
        counters: cache.counters(false)?,
        history: cache.history(false),
    };
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    } else {
        write!(out, "{}", render_stats(&report.counters, &report.history))?;
    }
    Ok(())
}

fn handle_reset(yes: bool, sandbox: bool, config: &Config, out: &mut dyn Write) -> CliResult<()> {
    if !yes {
        return Err(CliError::InvalidArgument(
            "reset deletes every download; pass --yes to confirm".to_string(),
        ));
    }
    let backend = open_backend(config, sandbox)?;
    let removed = reset_downloads(&*backend)?;
    writeln!(out, "Removed {removed} downloads.")?;
    Ok(())
}
