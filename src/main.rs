//! vrclog - tail, replay and parse VRChat log files as typed events.

use std::collections::HashSet;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vrclog::batch::{self, ParseFileError, ParseOptions};
use vrclog::config::{ConfigError, ConfigLoader, VrclogConfig};
use vrclog::event::EventType;
use vrclog::output::{self, OutputError, OutputFormat};
use vrclog::watcher::{ReplayDirective, WatchConfig, WatchEngine, WatchError};

#[derive(Parser)]
#[command(
    name = "vrclog",
    about = "Tail, replay and parse VRChat log files",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ./.vrclog.toml, then the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the latest log file and print events as they happen.
    Tail(TailArgs),
    /// Parse finished log files (batch mode).
    Parse(ParseArgs),
    /// List valid event type names.
    Types,
}

#[derive(Args)]
struct FilterArgs {
    /// VRChat log directory (auto-detected if not specified)
    #[arg(short = 'd', long)]
    log_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// Event types to include (comma-separated)
    #[arg(long, value_delimiter = ',')]
    include_types: Vec<EventType>,

    /// Event types to exclude (comma-separated)
    #[arg(long, value_delimiter = ',')]
    exclude_types: Vec<EventType>,

    /// Include raw log lines in output
    #[arg(long)]
    raw: bool,

    /// Stop on the first malformed line
    #[arg(long)]
    stop_on_error: bool,
}

#[derive(Args)]
struct TailArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Replay the last N lines before following (0 = whole file)
    #[arg(long, value_name = "N", conflicts_with = "replay_since")]
    replay_last: Option<usize>,

    /// Replay events at or after this time (RFC 3339)
    #[arg(long, value_name = "TIME", value_parser = parse_timestamp)]
    replay_since: Option<DateTime<Local>>,

    /// How often to check for a newer log file, in milliseconds
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,
}

#[derive(Args)]
struct ParseArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Only events at or after this time (RFC 3339)
    #[arg(long, value_name = "TIME", value_parser = parse_timestamp)]
    since: Option<DateTime<Local>>,

    /// Only events before this time (RFC 3339)
    #[arg(long, value_name = "TIME", value_parser = parse_timestamp)]
    until: Option<DateTime<Local>>,

    /// Log files to parse instead of the log directory
    files: Vec<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Parse(#[from] ParseFileError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("event type {0} cannot be both included and excluded")]
    TypeOverlap(EventType),

    #[error("--since must be before --until")]
    InvalidRange,

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn parse_timestamp(s: &str) -> Result<DateTime<Local>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| format!("{e} (expected RFC 3339, e.g. 2024-01-15T12:00:00Z)"))
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// Resolved include/exclude lists: flags win over the config file.
struct TypeSelection {
    include: Vec<EventType>,
    exclude: Vec<EventType>,
}

impl TypeSelection {
    fn resolve(args: &FilterArgs, file: &VrclogConfig) -> Result<Self, CliError> {
        let pick = |flag: &[EventType], file: &[EventType]| {
            let source = if flag.is_empty() { file } else { flag };
            let mut seen = HashSet::new();
            source
                .iter()
                .copied()
                .filter(|t| seen.insert(*t))
                .collect::<Vec<_>>()
        };
        let include = pick(&args.include_types, &file.include_types);
        let exclude = pick(&args.exclude_types, &file.exclude_types);

        if let Some(t) = include.iter().find(|t| exclude.contains(*t)) {
            return Err(CliError::TypeOverlap(*t));
        }
        Ok(Self { include, exclude })
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, shutting down");
            token.cancel();
        }
    });
}

fn is_broken_pipe(err: &OutputError) -> bool {
    matches!(err, OutputError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
}

async fn run_tail(args: TailArgs, file: VrclogConfig) -> Result<(), CliError> {
    let types = TypeSelection::resolve(&args.filter, &file)?;
    let poll_interval = args
        .poll_interval_ms
        .map_or_else(|| file.poll_interval(), Duration::from_millis);
    if poll_interval.is_zero() {
        return Err(CliError::ZeroPollInterval);
    }

    let replay = match (args.replay_last, args.replay_since) {
        (Some(0), _) => ReplayDirective::FromStart,
        (Some(n), _) => ReplayDirective::LastN(n),
        (None, Some(since)) => ReplayDirective::SinceTime(since),
        (None, None) => ReplayDirective::None,
    };

    let config = WatchConfig {
        log_dir: args.filter.log_dir.or(file.log_dir.clone()),
        poll_interval,
        include_raw_line: args.filter.raw || file.include_raw_line,
        replay,
        max_replay_lines: file.max_replay_lines(),
        include_types: types.include,
        exclude_types: types.exclude,
        stop_on_parse_error: args.filter.stop_on_error,
        diagnostics: Some(tracing::dispatcher::get_default(tracing::Dispatch::clone)),
    };
    let format = args.filter.format.unwrap_or(file.format);
    let color = io::stdout().is_terminal();

    let token = CancellationToken::new();
    cancel_on_ctrl_c(&token);

    let engine = WatchEngine::new(config)?;
    tracing::info!(dir = %engine.log_dir().display(), replay = ?replay, "Watching log directory");
    let (mut events, mut errors) = engine.start(&token)?;

    let mut last_error = None;
    let mut result: Result<(), CliError> = Ok(());
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = output::write_event(&mut io::stdout().lock(), format, &event, color) {
                    if !is_broken_pipe(&e) {
                        result = Err(e.into());
                    }
                    break;
                }
            }
            Some(err) = errors.recv() => {
                eprintln!("{} {err}", "[ERROR]".red().bold());
                last_error = Some(err);
            }
        }
    }

    engine.stop().await;
    while let Ok(err) = errors.try_recv() {
        eprintln!("{} {err}", "[ERROR]".red().bold());
        last_error = Some(err);
    }

    result?;
    // The watch only ends on its own after a fatal error.
    match last_error {
        Some(err) if !token.is_cancelled() => Err(err.into()),
        _ => Ok(()),
    }
}

async fn run_parse(args: ParseArgs, file: VrclogConfig) -> Result<(), CliError> {
    let types = TypeSelection::resolve(&args.filter, &file)?;
    if let (Some(since), Some(until)) = (args.since, args.until) {
        if since > until {
            return Err(CliError::InvalidRange);
        }
    }

    let token = CancellationToken::new();
    cancel_on_ctrl_c(&token);

    let options = ParseOptions {
        include_types: types.include,
        exclude_types: types.exclude,
        since: args.since,
        until: args.until,
        include_raw_line: args.filter.raw || file.include_raw_line,
        stop_on_error: args.filter.stop_on_error,
        cancel: Some(token),
    };
    let format = args.filter.format.unwrap_or(file.format);
    let color = io::stdout().is_terminal();
    let log_dir = args.filter.log_dir.or(file.log_dir);
    let files = args.files;

    tokio::task::spawn_blocking(move || -> Result<(), CliError> {
        let events = if files.is_empty() {
            batch::parse_dir(log_dir.as_deref(), &options)
        } else {
            batch::parse_paths(files, &options)
        };

        let mut stdout = io::stdout().lock();
        for event in events {
            match event {
                Ok(event) => match output::write_event(&mut stdout, format, &event, color) {
                    Ok(()) => {}
                    Err(e) if is_broken_pipe(&e) => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
                Err(ParseFileError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    })
    .await?
}

fn print_types() {
    for name in EventType::names() {
        println!("{name}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file_config = match &cli.config {
        Some(path) => ConfigLoader::load_file(path),
        None => ConfigLoader::new().load(),
    };

    let result = match file_config {
        Ok(file_config) => match cli.command {
            Commands::Tail(args) => run_tail(args, file_config).await,
            Commands::Parse(args) => run_parse(args, file_config).await,
            Commands::Types => {
                print_types();
                Ok(())
            }
        },
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
