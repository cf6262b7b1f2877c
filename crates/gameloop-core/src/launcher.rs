//! Starting, locating and stopping the target application.
//!
//! A [`Launcher`] resolves the configured target, starts it with the scenario
//! parameter and later tears it down. Resolution failures (nothing installed
//! under that identifier, no device) surface as [`LaunchError`] before any
//! helper task is started.
//!
//! | Launcher | Resolve | Start | Result waiter | Artifacts |
//! |----------|---------|-------|---------------|-----------|
//! | [`SimctlLauncher`] | `get_app_container` | `simctl launch` or `simctl openurl` | none | data container |
//! | [`AdbLauncher`] | `pm path` | `am instrument -w` harness or `am start` intent | harness run | harness or app files |
//! | [`ProcessLauncher`] | `which` | child process | the child | results directory |
//!
//! Between attempts of a retried run the orchestrator calls
//! [`Launcher::recover`]; [`AdbLauncher`] can reboot the device there.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::adb::{Adb, AdbError};
use crate::config::{gameloop_dir, ScenarioConfig, ENV_SESSION};
use crate::diagnostics::{AdbStore, ArtifactStore, DirectoryStore};
use crate::signal::activity::ActivityResultSource;
use crate::simctl::{Simctl, SimctlError};

/// Errors raised while resolving or starting the target.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// No target identifier was configured.
    #[error("No target application configured")]
    NoTarget,

    /// No device to launch on.
    #[error("No device available: {0}")]
    NoDevice(String),

    /// The target identifier does not resolve to an installed app.
    #[error("Target '{0}' is not installed")]
    AppNotInstalled(String),

    /// The target executable could not be found.
    #[error("Executable '{0}' not found")]
    ExecutableNotFound(String),

    /// The platform refused to start the target.
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// A simctl command failed.
    #[error("simctl error: {0}")]
    Simctl(#[from] SimctlError),

    /// An adb command failed.
    #[error("adb error: {0}")]
    Adb(#[from] AdbError),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A started target.
#[derive(Debug, Default)]
pub struct LaunchHandle {
    /// Process id, when the platform reports one.
    pub pid: Option<u32>,
    result_child: Option<Child>,
}

impl LaunchHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            result_child: None,
        }
    }

    /// Attaches a child process whose exit reports the result.
    pub fn with_result_child(mut self, child: Child) -> Self {
        self.result_child = Some(child);
        self
    }

    /// Whether the launch produced a result waiter.
    pub fn has_result_waiter(&self) -> bool {
        self.result_child.is_some()
    }

    /// Turns the result waiter, if any, into a signal source.
    pub fn take_result_source(&mut self) -> Option<ActivityResultSource> {
        self.result_child.take().map(ActivityResultSource::new)
    }
}

/// Platform mechanism for starting and stopping the target.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Resolves and starts the target.
    async fn launch(&self, config: &ScenarioConfig) -> Result<LaunchHandle, LaunchError>;

    /// Stops the target. Called once per run, after diagnostics.
    async fn terminate(&self, config: &ScenarioConfig) -> Result<(), LaunchError> {
        let _ = config;
        Ok(())
    }

    /// Where the target leaves its result files.
    async fn artifact_store(&self, config: &ScenarioConfig) -> Option<Arc<dyn ArtifactStore>> {
        let _ = config;
        None
    }

    /// Restores the device after an attempt whose result failed, before the
    /// next attempt.
    async fn recover(&self, config: &ScenarioConfig) -> Result<(), LaunchError> {
        let _ = config;
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, LaunchError>
where
    F: FnOnce() -> Result<T, LaunchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LaunchError::LaunchFailed(e.to_string()))?
}

/// `--key=value` arguments for the extra launch parameters.
fn parameter_args(config: &ScenarioConfig) -> Vec<String> {
    config
        .extra_parameters()
        .iter()
        .map(|(key, value)| format!("--{}={}", key, value))
        .collect()
}

/// Starts a host executable as the target.
///
/// The child receives `--game_loop_scenario=<id>`, `--game_loop_results_dir=<dir>`
/// and the extra parameters, and its exit is the result.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Results directory for a run: the configured one or `~/.gameloop/results`.
    pub fn results_dir(config: &ScenarioConfig) -> PathBuf {
        config
            .results_dir()
            .map(PathBuf::from)
            .unwrap_or_else(|| gameloop_dir().join("results"))
    }

    /// Arguments passed to the target.
    pub fn arguments(config: &ScenarioConfig) -> Vec<String> {
        let constants = config.constants();
        let mut args = vec![
            constants.scenario_arg(config.scenario_id()),
            constants.results_dir_arg(&Self::results_dir(config)),
        ];
        args.extend(parameter_args(config));
        args
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, config: &ScenarioConfig) -> Result<LaunchHandle, LaunchError> {
        let target = config.target().ok_or(LaunchError::NoTarget)?;
        let program = which::which(target).map_err(|_| LaunchError::ExecutableNotFound(target.to_string()))?;

        let results_dir = Self::results_dir(config);
        tokio::fs::create_dir_all(&results_dir).await?;

        let mut command = Command::new(&program);
        command.args(Self::arguments(config));
        if let Some(session) = config.session() {
            command.env(ENV_SESSION, session);
        }
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::LaunchFailed(format!("{}: {}", program.display(), e)))?;

        let pid = child.id();
        info!(program = %program.display(), ?pid, "target process started");
        Ok(LaunchHandle::new(pid).with_result_child(child))
    }

    async fn artifact_store(&self, config: &ScenarioConfig) -> Option<Arc<dyn ArtifactStore>> {
        Some(Arc::new(DirectoryStore::new(Self::results_dir(config))))
    }
}

/// How a simulator target is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimctlLaunchMode {
    /// `simctl launch` with the scenario as a launch argument.
    #[default]
    Direct,
    /// `simctl openurl` with the game loop launch URL.
    UrlScheme,
}

/// Launches a bundle on an iOS/tvOS simulator.
#[derive(Debug, Clone, Default)]
pub struct SimctlLauncher {
    mode: SimctlLaunchMode,
}

impl SimctlLauncher {
    pub fn new(mode: SimctlLaunchMode) -> Self {
        Self { mode }
    }

    /// The configured device, booting it if needed, or the booted simulator.
    pub async fn resolve_device(config: &ScenarioConfig) -> Result<String, LaunchError> {
        let device = config.device().map(str::to_string);
        blocking(move || match device {
            Some(udid) => {
                Simctl::boot(&udid)?;
                Ok(udid)
            }
            None => Simctl::get_booted_udid().map_err(|e| LaunchError::NoDevice(e.to_string())),
        })
        .await
    }

    /// Arguments passed to the app in direct mode.
    pub fn arguments(config: &ScenarioConfig) -> Vec<String> {
        let mut args = vec![config.constants().scenario_arg(config.scenario_id())];
        args.extend(parameter_args(config));
        args
    }
}

#[async_trait]
impl Launcher for SimctlLauncher {
    fn name(&self) -> &'static str {
        "simctl"
    }

    async fn launch(&self, config: &ScenarioConfig) -> Result<LaunchHandle, LaunchError> {
        let bundle = config.target().ok_or(LaunchError::NoTarget)?.to_string();
        let udid = Self::resolve_device(config).await?;
        let mode = self.mode;
        let args = Self::arguments(config);
        let url = config
            .constants()
            .launch_url(config.scenario_id(), config.extra_parameters());

        let pid = blocking(move || {
            Simctl::app_container(&udid, &bundle, "app").map_err(|e| match e {
                SimctlError::AppNotInstalled(b) => LaunchError::AppNotInstalled(b),
                other => LaunchError::Simctl(other),
            })?;
            match mode {
                SimctlLaunchMode::Direct => Ok(Simctl::launch(&udid, &bundle, &args)?),
                SimctlLaunchMode::UrlScheme => {
                    debug!(%url, "opening launch url");
                    Simctl::open_url(&udid, &url)?;
                    Ok(None)
                }
            }
        })
        .await?;

        info!(?pid, ?mode, "target launched on simulator");
        Ok(LaunchHandle::new(pid))
    }

    async fn terminate(&self, config: &ScenarioConfig) -> Result<(), LaunchError> {
        let bundle = config.target().ok_or(LaunchError::NoTarget)?.to_string();
        let udid = Self::resolve_device(config).await?;
        blocking(move || Ok(Simctl::terminate(&udid, &bundle)?)).await
    }

    async fn artifact_store(&self, config: &ScenarioConfig) -> Option<Arc<dyn ArtifactStore>> {
        if let Some(dir) = config.results_dir() {
            return Some(Arc::new(DirectoryStore::new(dir)));
        }
        let bundle = config.target()?.to_string();
        let udid = Self::resolve_device(config).await.ok()?;
        let subdir = config.constants().results_subdir.clone();
        let data = blocking(move || Ok(Simctl::app_container(&udid, &bundle, "data")?))
            .await
            .ok()?;
        Some(Arc::new(DirectoryStore::new(data.join(subdir))))
    }
}

/// How an Android target is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdbLaunchMode {
    /// Through the game loop harness, waiting for its result.
    #[default]
    Harness,
    /// The game loop intent sent straight to the app.
    Intent,
}

/// Longest wait for a rebooted device to finish booting.
const BOOT_TIMEOUT: Duration = Duration::from_secs(180);
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Launches a package on an Android device or emulator.
///
/// In harness mode the `am instrument` output is captured, so a harness run
/// that reports `FAILURES!!!` fails the session.
#[derive(Debug, Clone, Default)]
pub struct AdbLauncher {
    mode: AdbLaunchMode,
    reboot_on_failure: bool,
}

impl AdbLauncher {
    pub fn new(mode: AdbLaunchMode) -> Self {
        Self {
            mode,
            reboot_on_failure: false,
        }
    }

    /// Reboots the device before retrying an attempt whose result failed.
    pub fn with_reboot_on_failure(mut self, reboot: bool) -> Self {
        self.reboot_on_failure = reboot;
        self
    }

    fn adb(config: &ScenarioConfig) -> Adb {
        Adb::new(config.device().map(str::to_string))
    }

    async fn resolve_package(adb: &Adb, package: &str) -> Result<(), LaunchError> {
        let adb = adb.clone();
        let package = package.to_string();
        blocking(move || match adb.package_path(&package) {
            Ok(path) => {
                debug!(%package, %path, "package resolved");
                Ok(())
            }
            Err(AdbError::PackageNotInstalled(p)) => Err(LaunchError::AppNotInstalled(p)),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

#[async_trait]
impl Launcher for AdbLauncher {
    fn name(&self) -> &'static str {
        "adb"
    }

    async fn launch(&self, config: &ScenarioConfig) -> Result<LaunchHandle, LaunchError> {
        let package = config.target().ok_or(LaunchError::NoTarget)?.to_string();
        let adb = Self::adb(config);
        let constants = config.constants();
        Self::resolve_package(&adb, &package).await?;

        match self.mode {
            AdbLaunchMode::Harness => {
                let harness = constants.android_harness.clone();
                Self::resolve_package(&adb, &harness)
                    .await
                    .map_err(|e| LaunchError::LaunchFailed(format!("game loop harness unavailable: {}", e)))?;

                let child = Command::new("adb")
                    .args(adb.instrument_args(&harness, &package, config.scenario_id()))
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()?;
                info!(%package, %harness, "game loop harness started");
                Ok(LaunchHandle::new(None).with_result_child(child))
            }
            AdbLaunchMode::Intent => {
                let action = constants.android_action.clone();
                let scenario = config.scenario_id();
                let intent_adb = adb.clone();
                let intent_package = package.clone();
                blocking(move || Ok(intent_adb.start_intent(&action, &intent_package, scenario)?)).await?;
                info!(%package, "game loop intent dispatched");
                Ok(LaunchHandle::new(None))
            }
        }
    }

    async fn terminate(&self, config: &ScenarioConfig) -> Result<(), LaunchError> {
        let package = config.target().ok_or(LaunchError::NoTarget)?.to_string();
        let adb = Self::adb(config);
        blocking(move || Ok(adb.force_stop(&package)?)).await
    }

    async fn recover(&self, config: &ScenarioConfig) -> Result<(), LaunchError> {
        if !self.reboot_on_failure {
            return Ok(());
        }
        let adb = Self::adb(config);
        warn!(serial = ?adb.serial(), "rebooting device after failed game loop");
        let reboot_adb = adb.clone();
        blocking(move || Ok(reboot_adb.reboot()?)).await?;

        let deadline = tokio::time::Instant::now() + BOOT_TIMEOUT;
        loop {
            let probe = adb.clone();
            if blocking(move || Ok(probe.boot_completed()?)).await.unwrap_or(false) {
                info!("device booted");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LaunchError::NoDevice(format!(
                    "device did not finish booting within {:?}",
                    BOOT_TIMEOUT
                )));
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }
    }

    async fn artifact_store(&self, config: &ScenarioConfig) -> Option<Arc<dyn ArtifactStore>> {
        let package = config.target()?;
        let adb = Self::adb(config);
        let store = match self.mode {
            AdbLaunchMode::Harness => AdbStore::for_harness(adb, &config.constants().android_harness, package),
            AdbLaunchMode::Intent => AdbStore::for_app(adb, package),
        };
        Some(Arc::new(store))
    }
}
