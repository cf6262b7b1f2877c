//! Command-line driver for unattended game loop runs.
//!
//! # Usage
//!
//! ```bash
//! # Run scenario 3 of a simulator app, waiting up to 5 minutes
//! gameloop run --target com.example.game --scenario 3 --timeout 300
//!
//! # Same, configured from the environment
//! GAMELOOP_SCENARIO=3 GAMELOOP_TARGET=com.example.game gameloop run
//!
//! # Android, through the game loop harness
//! gameloop run --platform android --target com.example.game --device emulator-5554
//!
//! # A host build that exits when its scenario is done
//! gameloop run --platform process --target ./build/game --param level=2
//!
//! # Report completion from inside a target (or a test double); the run
//! # exports its session name as GAMELOOP_SESSION
//! gameloop signal "gameloop-complete://?scenario=3" --session nightly
//!
//! # Check a gtest or Unity log
//! gameloop validate results.log --flavor unity
//! ```
//!
//! `run` exits 0 when the scenario completed, 1 when it failed, timed out or
//! was interrupted and 2 on configuration errors. Ctrl-C cancels the wait;
//! the target is still terminated and diagnostics printed.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use gameloop_core::axe::{Axe, AxeDialogSurface};
use gameloop_core::config::{
    gameloop_dir, logs_dir, parse_parameter, resolve_scenario, resolve_timeout, ConfigError,
    GameloopSettings, Platform, ScenarioConfig, TimeoutLane,
};
use gameloop_core::diagnostics::{SimctlPasteboard, SystemPasteboard};
use gameloop_core::launcher::{
    AdbLaunchMode, AdbLauncher, Launcher, ProcessLauncher, SimctlLaunchMode, SimctlLauncher,
};
use gameloop_core::orchestrator::{Orchestrator, RunResult};
use gameloop_core::signal::callback::{
    fresh_session_name, post_callback, socket_path, CallbackReply, UrlCallbackSource,
};
use gameloop_core::signal::foreground::{ForegroundSource, SimctlForegroundProbe};
use gameloop_core::signal::notification::NotificationSource;
use gameloop_core::validation::{validate, LogFlavor, Verdict};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Command-line driver for unattended game loop runs.
#[derive(Parser)]
#[command(name = "gameloop")]
#[command(about = "Launch a game loop scenario and wait for it to report completion")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlatformArg {
    Simulator,
    Android,
    Process,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Simulator => Platform::Simulator,
            PlatformArg::Android => Platform::Android,
            PlatformArg::Process => Platform::Process,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LaneArg {
    Ci,
    DeviceFarm,
}

impl From<LaneArg> for TimeoutLane {
    fn from(arg: LaneArg) -> Self {
        match arg {
            LaneArg::Ci => TimeoutLane::Ci,
            LaneArg::DeviceFarm => TimeoutLane::DeviceFarm,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Launch a scenario and wait for its completion signal
    Run(RunArgs),

    /// Post a completion URL to a waiting run
    Signal {
        /// The completion URL, e.g. gameloop-complete://?scenario=1
        url: String,
        /// Session name of the waiting run
        #[arg(short, long, env = "GAMELOOP_SESSION")]
        session: String,
    },

    /// Summarize a gtest or Unity log
    Validate {
        /// Log file to read
        file: PathBuf,
        /// Test runner that wrote the log (cpp, gtest, unity)
        #[arg(long, default_value = "cpp")]
        flavor: LogFlavor,
    },

    /// Show or change persisted defaults
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Scenario id
    #[arg(long, env = "GAMELOOP_SCENARIO")]
    scenario: Option<String>,

    /// Timeout in seconds; non-positive means do not wait
    #[arg(long, env = "GAMELOOP_TIMEOUT", allow_hyphen_values = true)]
    timeout: Option<String>,

    /// Lane deciding the fallback timeout
    #[arg(long)]
    lane: Option<LaneArg>,

    /// Where the target runs
    #[arg(long, default_value = "simulator")]
    platform: PlatformArg,

    /// Bundle id, package name or executable
    #[arg(long, env = "GAMELOOP_TARGET")]
    target: Option<String>,

    /// Simulator UDID or adb serial
    #[arg(long, env = "GAMELOOP_DEVICE")]
    device: Option<String>,

    /// Host directory the target writes results to
    #[arg(long, env = "GAMELOOP_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Extra launch parameter, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Session name for the completion URL listener [default: a fresh run-<uuid>]
    #[arg(short, long, env = "GAMELOOP_SESSION")]
    session: Option<String>,

    /// Total attempts for timed-out, failed or incomplete runs
    #[arg(long, default_value = "1")]
    retries: u32,

    /// Reboot the Android device after a failed result, before retrying
    #[arg(long)]
    reboot_on_failure: bool,

    /// Do not dismiss system dialogs
    #[arg(long)]
    no_suppress_dialogs: bool,

    /// Do not listen for the completion URL
    #[arg(long)]
    no_callback: bool,

    /// Do not wait for the completion notification
    #[arg(long)]
    no_notification: bool,

    /// Do not poll for the harness returning to the foreground
    #[arg(long)]
    no_foreground: bool,

    /// Do not read the pasteboard after the run
    #[arg(long)]
    no_clipboard: bool,

    /// Start simulator targets through their launch URL
    #[arg(long)]
    url_launch: bool,

    /// Send the game loop intent to Android targets directly, without the harness
    #[arg(long)]
    intent: bool,

    /// Do not write the session event log
    #[arg(long)]
    no_event_log: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the persisted defaults
    Show,
    /// Update persisted defaults
    Set {
        /// Default device
        #[arg(long)]
        device: Option<String>,
        /// Default results directory
        #[arg(long)]
        results_dir: Option<PathBuf>,
        /// Default timeout lane
        #[arg(long)]
        lane: Option<LaneArg>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_tracing(cli: &Cli) -> Option<WorkerGuard> {
    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (writer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path.file_name().map(PathBuf::from).unwrap_or_else(|| "gameloop.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(cli.log_file.is_none());
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    guard
}

#[derive(Debug)]
enum CliError {
    /// Invalid arguments or settings.
    Config(String),
    /// The run, the callback or the validated log reported failure.
    Failed(String),
    /// Could not reach a waiting run.
    Connection(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Failed(_) => ExitCode::from(1),
            CliError::Config(_) | CliError::Connection(_) => ExitCode::from(2),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Failed(msg) => write!(f, "{}", msg),
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Run(args) => run_scenario(args, cli.format).await,
        Command::Signal { url, session } => send_signal(url, session, cli.format).await,
        Command::Validate { file, flavor } => validate_log(file, *flavor, cli.format),
        Command::Config { action } => configure(action, cli.format),
    }
}

fn build_config(args: &RunArgs, settings: &GameloopSettings) -> Result<ScenarioConfig, CliError> {
    let lane = args
        .lane
        .map(TimeoutLane::from)
        .or(settings.lane)
        .unwrap_or_default();
    let scenario = resolve_scenario(args.scenario.as_deref())?;
    let timeout = resolve_timeout(args.timeout.as_deref(), lane);

    let session = args
        .session
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(fresh_session_name);

    let mut builder = ScenarioConfig::builder(scenario)
        .timeout(timeout)
        .platform(args.platform.into())
        .session(session);
    if let Some(target) = args.target.as_deref().filter(|t| !t.trim().is_empty()) {
        builder = builder.target(target);
    }
    if let Some(device) = args.device.clone().or_else(|| settings.device.clone()) {
        builder = builder.device(device);
    }
    if let Some(dir) = args.results_dir.clone().or_else(|| settings.results_dir.clone()) {
        builder = builder.results_dir(dir);
    }
    for raw in &args.params {
        let (key, value) = parse_parameter(raw)?;
        builder = builder.parameter(key, value);
    }
    Ok(builder.build())
}

async fn build_orchestrator(args: &RunArgs, config: &ScenarioConfig) -> Orchestrator {
    let launcher: Arc<dyn Launcher> = match config.platform() {
        Platform::Simulator => Arc::new(SimctlLauncher::new(if args.url_launch {
            SimctlLaunchMode::UrlScheme
        } else {
            SimctlLaunchMode::Direct
        })),
        Platform::Android => Arc::new(
            AdbLauncher::new(if args.intent {
                AdbLaunchMode::Intent
            } else {
                AdbLaunchMode::Harness
            })
            .with_reboot_on_failure(args.reboot_on_failure),
        ),
        Platform::Process => Arc::new(ProcessLauncher::new()),
    };

    let mut orchestrator = Orchestrator::new(launcher);
    if !args.no_event_log {
        orchestrator = orchestrator.with_log_dir(logs_dir());
    }
    if !args.no_callback {
        let session = config.session().map(str::to_string).unwrap_or_else(fresh_session_name);
        orchestrator =
            orchestrator.with_signal_source(Arc::new(UrlCallbackSource::for_session(config, &session)));
    }

    match config.platform() {
        Platform::Simulator => {
            // Helpers need a device; the launcher reports a missing one itself.
            let udid = match SimctlLauncher::resolve_device(config).await {
                Ok(udid) => udid,
                Err(e) => {
                    warn!(error = %e, "no simulator for signal helpers");
                    return orchestrator;
                }
            };
            let constants = config.constants();
            if !args.no_notification {
                orchestrator = orchestrator.with_signal_source(Arc::new(NotificationSource::simctl(
                    &udid,
                    constants.notification_name.clone(),
                )));
            }
            if let (false, Some(bundle)) = (args.no_foreground, config.target()) {
                let probe = SimctlForegroundProbe::new(
                    &udid,
                    bundle,
                    constants.results_subdir.clone(),
                    config.sentinel_file_name(),
                    constants.completion_marker.clone(),
                );
                orchestrator = orchestrator.with_signal_source(Arc::new(ForegroundSource::new(
                    Arc::new(probe),
                    constants.foreground_interval(),
                )));
            }
            if !args.no_suppress_dialogs {
                if Axe::is_installed() {
                    orchestrator = orchestrator.with_dialog_surface(Arc::new(AxeDialogSurface::new(&udid)));
                } else {
                    warn!("axe not installed; system dialogs will not be dismissed");
                }
            }
            if !args.no_clipboard {
                orchestrator = orchestrator.with_pasteboard(Arc::new(SimctlPasteboard::new(&udid)));
            }
        }
        Platform::Process => {
            if !args.no_clipboard {
                orchestrator = orchestrator.with_pasteboard(Arc::new(SystemPasteboard));
            }
        }
        Platform::Android => {}
    }
    orchestrator
}

async fn run_scenario(args: &RunArgs, format: OutputFormat) -> Result<(), CliError> {
    let settings = GameloopSettings::load();
    let config = build_config(args, &settings)?;
    let orchestrator = build_orchestrator(args, &config).await;
    info!(
        scenario = config.scenario_id(),
        platform = %config.platform(),
        session = config.session().unwrap_or("-"),
        sources = ?orchestrator.signal_sources(),
        "configured run"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping the target");
            interrupt.cancel();
        }
    });
    let result = orchestrator.run_with_retry(&config, args.retries, &cancel).await;
    watcher.abort();

    print_result(&result, format);
    match result.failure_reason() {
        None => Ok(()),
        Some(reason) => Err(CliError::Failed(reason)),
    }
}

fn print_result(result: &RunResult, format: OutputFormat) {
    if format == OutputFormat::Json {
        match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: could not serialize result: {}", e),
        }
        return;
    }

    match (&result.marker, result.failure_reason()) {
        (Some(marker), _) => println!("{}", marker),
        (None, Some(reason)) => println!("{}", reason),
        (None, None) => println!("{:?}", result.state),
    }
    if let Some(signal) = &result.signal {
        eprintln!("signal: {}", signal.kind());
    }
    if let Some(text) = &result.diagnostics.sentinel_text {
        eprintln!("--- sentinel ---\n{}", text.trim_end());
    } else if let Some(location) = &result.diagnostics.artifact_location {
        eprintln!("no sentinel file in {}", location);
    }
    if let Some(output) = &result.diagnostics.result_output {
        eprintln!("--- result output ---\n{}", output);
    }
    for entry in &result.diagnostics.clipboard_entries {
        eprintln!("pasteboard: {}", entry);
    }
    if let Some(summary) = &result.diagnostics.summary {
        eprintln!(
            "tests: {} passed, {} failed, {} skipped{}",
            summary.passes,
            summary.fails,
            summary.skips,
            if summary.complete { "" } else { " (incomplete)" }
        );
    }
    if result.attempts > 1 {
        eprintln!("attempts: {}", result.attempts);
    }
}

async fn send_signal(url: &str, session: &str, format: OutputFormat) -> Result<(), CliError> {
    let socket = socket_path(session);
    let reply = post_callback(&socket, url)
        .await
        .map_err(|e| CliError::Connection(format!("{}: {}", socket.display(), e)))?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&reply).unwrap_or_default());
    }
    match reply {
        CallbackReply::Ack | CallbackReply::Pong => {
            if format == OutputFormat::Text {
                println!("Accepted");
            }
            Ok(())
        }
        CallbackReply::AlreadyResolved => {
            if format == OutputFormat::Text {
                println!("Already resolved");
            }
            Ok(())
        }
        CallbackReply::Rejected { message } => Err(CliError::Failed(format!("Rejected: {}", message))),
    }
}

fn validate_log(file: &Path, flavor: LogFlavor, format: OutputFormat) -> Result<(), CliError> {
    let log = std::fs::read_to_string(file)
        .map_err(|e| CliError::Config(format!("cannot read {}: {}", file.display(), e)))?;
    let summary = validate(&log, flavor);
    let verdict = summary.verdict();

    if format == OutputFormat::Json {
        let output = serde_json::json!({
            "verdict": verdict,
            "complete": summary.complete,
            "passes": summary.passes,
            "fails": summary.fails,
            "skips": summary.skips,
            "failed_tests": summary.failed_tests(),
            "summary": summary.summary,
        });
        println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
    } else {
        println!("{}", summary.summary.trim_end());
        println!(
            "{} passed, {} failed, {} skipped",
            summary.passes, summary.fails, summary.skips
        );
    }

    match verdict {
        Verdict::Success => Ok(()),
        Verdict::Failure => Err(CliError::Failed(format!("{} test(s) failed", summary.fails))),
        Verdict::Error => Err(CliError::Failed(format!("{} log is incomplete", flavor))),
    }
}

fn configure(action: &ConfigAction, format: OutputFormat) -> Result<(), CliError> {
    let mut settings = GameloopSettings::load();
    if let ConfigAction::Set {
        device,
        results_dir,
        lane,
    } = action
    {
        if let Some(device) = device {
            settings.device = Some(device.clone());
        }
        if let Some(dir) = results_dir {
            settings.results_dir = Some(dir.clone());
        }
        if let Some(lane) = lane {
            settings.lane = Some((*lane).into());
        }
        settings.save()?;
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&settings).unwrap_or_default());
        }
        OutputFormat::Text => {
            println!("config: {}", gameloop_dir().join("config.json").display());
            println!("device: {}", settings.device.as_deref().unwrap_or("-"));
            println!(
                "results_dir: {}",
                settings
                    .results_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!(
                "lane: {}",
                settings
                    .lane
                    .map(|lane| format!("{:?}", lane))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }
    Ok(())
}
