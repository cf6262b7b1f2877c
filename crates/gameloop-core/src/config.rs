//! Run configuration for game loop orchestration.
//!
//! A run is described by an immutable [`ScenarioConfig`], resolved once at
//! process start from the environment and/or command-line flags and threaded
//! through every component. Platform strings (URL schemes, notification names,
//! sentinel naming, dialog labels) live in a [`LaunchConstants`] table carried
//! by the config rather than in globals.
//!
//! User defaults that survive between runs are stored in
//! `~/.gameloop/config.json` as [`GameloopSettings`].
//!
//! # Example
//!
//! ```no_run
//! use gameloop_core::config::{ScenarioConfig, TimeoutLane};
//!
//! // GAMELOOP_SCENARIO / GAMELOOP_TIMEOUT / GAMELOOP_TARGET ...
//! let config = ScenarioConfig::from_env(TimeoutLane::DeviceFarm).unwrap();
//! println!("scenario {} for {:?}", config.scenario_id(), config.timeout());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the scenario id.
pub const ENV_SCENARIO: &str = "GAMELOOP_SCENARIO";
/// Environment variable holding the run timeout in seconds.
pub const ENV_TIMEOUT: &str = "GAMELOOP_TIMEOUT";
/// Environment variable holding the target application identifier.
pub const ENV_TARGET: &str = "GAMELOOP_TARGET";
/// Environment variable holding the device identifier (simulator UDID or adb serial).
pub const ENV_DEVICE: &str = "GAMELOOP_DEVICE";
/// Environment variable holding the host results directory.
pub const ENV_RESULTS_DIR: &str = "GAMELOOP_RESULTS_DIR";
/// Environment variable naming the run's callback session.
pub const ENV_SESSION: &str = "GAMELOOP_SESSION";

/// Scenario used when none is configured.
pub const DEFAULT_SCENARIO: i64 = 1;

/// Upper bound applied to configured timeouts.
const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SETTINGS_FILENAME: &str = "config.json";

/// Errors produced while resolving run configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The scenario id was present but not an integer.
    #[error("Invalid scenario id '{0}': expected an integer")]
    InvalidScenario(String),

    /// An extra parameter was not in `KEY=VALUE` form.
    #[error("Invalid parameter '{0}': expected KEY=VALUE")]
    InvalidParameter(String),

    /// An I/O error occurred while reading or writing settings.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns the gameloop state directory (`~/.gameloop/`).
///
/// Creates the directory if it doesn't exist. Falls back to the system
/// temporary directory when no home directory can be determined.
pub fn gameloop_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".gameloop");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns the session log directory (`~/.gameloop/logs/`), creating it if needed.
pub fn logs_dir() -> PathBuf {
    let dir = gameloop_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Deployment lane, which decides the fallback timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutLane {
    /// Constrained CI lane: 3 minutes.
    Ci,
    /// Full device-farm run: 15 minutes.
    #[default]
    DeviceFarm,
}

impl TimeoutLane {
    /// The timeout used when none (or a non-numeric one) is configured.
    pub fn default_timeout(self) -> Duration {
        match self {
            TimeoutLane::Ci => Duration::from_secs(3 * 60),
            TimeoutLane::DeviceFarm => Duration::from_secs(15 * 60),
        }
    }
}

/// Resolves a raw timeout value (seconds) into a [`Duration`].
///
/// - absent, blank or non-numeric: the lane default
/// - zero or negative: [`Duration::ZERO`], which times out without waiting
/// - otherwise the value, fractional seconds allowed, capped at seven days
pub fn resolve_timeout(raw: Option<&str>, lane: TimeoutLane) -> Duration {
    let parsed = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|secs| secs.is_finite());

    match parsed {
        Some(secs) if secs <= 0.0 => Duration::ZERO,
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(|d| d.min(MAX_TIMEOUT))
            .unwrap_or(MAX_TIMEOUT),
        None => lane.default_timeout(),
    }
}

/// Resolves a raw scenario id. Absent or blank falls back to [`DEFAULT_SCENARIO`].
pub fn resolve_scenario(raw: Option<&str>) -> Result<i64, ConfigError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(DEFAULT_SCENARIO),
        Some(s) => s
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidScenario(s.to_string())),
    }
}

/// Splits a `KEY=VALUE` launch parameter.
pub fn parse_parameter(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::InvalidParameter(raw.to_string())),
    }
}

/// How the target application is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// iOS/tvOS Simulator via `xcrun simctl`.
    #[default]
    Simulator,
    /// Android device or emulator via `adb`.
    Android,
    /// A host process started directly.
    Process,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Simulator => write!(f, "simulator"),
            Platform::Android => write!(f, "android"),
            Platform::Process => write!(f, "process"),
        }
    }
}

/// Fixed strings and intervals shared between the launcher, the signal
/// detectors, the dialog suppressor and the diagnostics collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConstants {
    /// Scheme used to start a scenario (`<scheme>://?scenario=<id>`).
    pub launch_scheme: String,
    /// Scheme the target invokes when its scenario is finished.
    pub completion_scheme: String,
    /// Inter-process notification name posted on completion.
    pub notification_name: String,
    /// Sentinel file name prefix; the scenario id follows it.
    pub sentinel_prefix: String,
    /// Sentinel file extension (without the dot).
    pub sentinel_extension: String,
    /// Text that becomes observable once a run completes.
    pub completion_marker: String,
    /// Dialog buttons the suppressor may activate.
    pub dialog_labels: Vec<String>,
    /// Dialog suppressor scan interval in milliseconds.
    pub dialog_interval_ms: u64,
    /// Foreground polling interval in milliseconds.
    pub foreground_interval_ms: u64,
    /// Command-line prefix carrying the scenario id to direct launches.
    pub scenario_arg_prefix: String,
    /// Command-line prefix carrying the results directory to direct launches.
    pub results_dir_arg_prefix: String,
    /// Android intent action dispatched for a game loop.
    pub android_action: String,
    /// Android harness package that launches the target for a result.
    pub android_harness: String,
    /// Results directory relative to the app data container.
    pub results_subdir: String,
}

impl Default for LaunchConstants {
    fn default() -> Self {
        Self {
            launch_scheme: "gameloop".to_string(),
            completion_scheme: "gameloop-complete".to_string(),
            notification_name: "com.google.firebase.gameloop.complete".to_string(),
            sentinel_prefix: "results_scenario_".to_string(),
            sentinel_extension: "json".to_string(),
            completion_marker: "Game Loop Complete".to_string(),
            dialog_labels: vec!["Open".to_string(), "Allow".to_string(), "OK".to_string()],
            dialog_interval_ms: 2000,
            foreground_interval_ms: 1000,
            scenario_arg_prefix: "--game_loop_scenario=".to_string(),
            results_dir_arg_prefix: "--game_loop_results_dir=".to_string(),
            android_action: "com.google.intent.action.TEST_LOOP".to_string(),
            android_harness: "com.google.firebase.gameloop".to_string(),
            results_subdir: "Documents/GameLoopResults".to_string(),
        }
    }
}

impl LaunchConstants {
    /// Sentinel file name for a scenario, e.g. `results_scenario_5.json`.
    pub fn sentinel_file_name(&self, scenario_id: i64) -> String {
        if self.sentinel_extension.is_empty() {
            format!("{}{}", self.sentinel_prefix, scenario_id)
        } else {
            format!("{}{}.{}", self.sentinel_prefix, scenario_id, self.sentinel_extension)
        }
    }

    /// URL that starts a scenario.
    pub fn launch_url(&self, scenario_id: i64, extra: &BTreeMap<String, String>) -> String {
        scheme_url(&self.launch_scheme, scenario_id, extra)
    }

    /// URL the target invokes when its scenario is finished.
    pub fn completion_url(&self, scenario_id: i64) -> String {
        scheme_url(&self.completion_scheme, scenario_id, &BTreeMap::new())
    }

    /// Command-line argument carrying the scenario id.
    pub fn scenario_arg(&self, scenario_id: i64) -> String {
        format!("{}{}", self.scenario_arg_prefix, scenario_id)
    }

    /// Command-line argument carrying the results directory.
    pub fn results_dir_arg(&self, dir: &Path) -> String {
        format!("{}{}", self.results_dir_arg_prefix, dir.display())
    }

    /// Dialog suppressor interval.
    pub fn dialog_interval(&self) -> Duration {
        Duration::from_millis(self.dialog_interval_ms)
    }

    /// Foreground polling interval.
    pub fn foreground_interval(&self) -> Duration {
        Duration::from_millis(self.foreground_interval_ms)
    }
}

fn scheme_url(scheme: &str, scenario_id: i64, extra: &BTreeMap<String, String>) -> String {
    let mut url = format!("{}://?scenario={}", scheme, scenario_id);
    for (key, value) in extra {
        url.push('&');
        url.push_str(&percent_encode(key));
        url.push('=');
        url.push_str(&percent_encode(value));
    }
    url
}

/// Percent-encodes everything outside the URL unreserved set.
pub(crate) fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Immutable parameters of one game loop run.
///
/// Built once through [`ScenarioConfig::builder`] or
/// [`ScenarioConfig::from_env`]; exposes read-only accessors only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    scenario_id: i64,
    timeout: Duration,
    target: Option<String>,
    extra_parameters: BTreeMap<String, String>,
    platform: Platform,
    device: Option<String>,
    results_dir: Option<PathBuf>,
    session: Option<String>,
    constants: LaunchConstants,
}

impl ScenarioConfig {
    /// Starts a builder for the given scenario.
    ///
    /// The timeout defaults to the [`TimeoutLane::DeviceFarm`] fallback.
    pub fn builder(scenario_id: i64) -> ScenarioConfigBuilder {
        ScenarioConfigBuilder {
            config: ScenarioConfig {
                scenario_id,
                timeout: TimeoutLane::DeviceFarm.default_timeout(),
                target: None,
                extra_parameters: BTreeMap::new(),
                platform: Platform::default(),
                device: None,
                results_dir: None,
                session: None,
                constants: LaunchConstants::default(),
            },
        }
    }

    /// Resolves a config from the process environment.
    pub fn from_env(lane: TimeoutLane) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), lane)
    }

    /// Resolves a config from an arbitrary key lookup (environment-shaped).
    pub fn from_lookup<F>(lookup: F, lane: TimeoutLane) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let scenario_id = resolve_scenario(lookup(ENV_SCENARIO).as_deref())?;
        let timeout = resolve_timeout(lookup(ENV_TIMEOUT).as_deref(), lane);
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut builder = Self::builder(scenario_id).timeout(timeout);
        if let Some(target) = non_blank(ENV_TARGET) {
            builder = builder.target(target);
        }
        if let Some(device) = non_blank(ENV_DEVICE) {
            builder = builder.device(device);
        }
        if let Some(dir) = non_blank(ENV_RESULTS_DIR) {
            builder = builder.results_dir(dir);
        }
        if let Some(session) = non_blank(ENV_SESSION) {
            builder = builder.session(session);
        }
        Ok(builder.build())
    }

    /// Integer id of the scenario to run.
    pub fn scenario_id(&self) -> i64 {
        self.scenario_id
    }

    /// Time allowed for the completion signal.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Target application identifier (bundle id, package or executable).
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Extra launch parameters forwarded to the target.
    pub fn extra_parameters(&self) -> &BTreeMap<String, String> {
        &self.extra_parameters
    }

    /// Launch platform.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Device identifier (simulator UDID or adb serial).
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Host directory holding result artifacts, if configured.
    pub fn results_dir(&self) -> Option<&Path> {
        self.results_dir.as_deref()
    }

    /// Name of the callback session the target reports to.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Shared constants table.
    pub fn constants(&self) -> &LaunchConstants {
        &self.constants
    }

    /// Sentinel file name for this run's scenario.
    pub fn sentinel_file_name(&self) -> String {
        self.constants.sentinel_file_name(self.scenario_id)
    }
}

/// Builder for [`ScenarioConfig`].
#[derive(Debug, Clone)]
pub struct ScenarioConfigBuilder {
    config: ScenarioConfig,
}

impl ScenarioConfigBuilder {
    /// Sets the run timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the target application identifier.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.config.target = Some(target.into());
        self
    }

    /// Adds an extra launch parameter.
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.extra_parameters.insert(key.into(), value.into());
        self
    }

    /// Sets the launch platform.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.config.platform = platform;
        self
    }

    /// Sets the device identifier.
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = Some(device.into());
        self
    }

    /// Sets the host results directory.
    pub fn results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.results_dir = Some(dir.into());
        self
    }

    /// Sets the callback session name.
    pub fn session(mut self, name: impl Into<String>) -> Self {
        self.config.session = Some(name.into());
        self
    }

    /// Replaces the constants table.
    pub fn constants(mut self, constants: LaunchConstants) -> Self {
        self.config.constants = constants;
        self
    }

    /// Finishes the config.
    pub fn build(self) -> ScenarioConfig {
        self.config
    }
}

/// Persistent user defaults.
///
/// Stored in `~/.gameloop/config.json`; every field is optional and
/// command-line flags take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GameloopSettings {
    /// Default device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Default host results directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<PathBuf>,

    /// Default timeout lane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<TimeoutLane>,
}

impl GameloopSettings {
    /// Load settings from `~/.gameloop/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&gameloop_dir().join(SETTINGS_FILENAME))
    }

    /// Load settings from an explicit path, defaulting on any failure.
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save settings to `~/.gameloop/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&gameloop_dir().join(SETTINGS_FILENAME))
    }

    /// Save settings to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
