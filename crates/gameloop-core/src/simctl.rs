//! Interface to Apple's `xcrun simctl` command-line tool.
//!
//! This module wraps the simulator control commands a game loop run needs:
//! device discovery and boot, app container lookup, direct and URL-scheme
//! launches, termination, pasteboard reads and the `launchctl` listing used
//! to tell whether the target is still running.
//!
//! # Requirements
//!
//! Xcode must be installed for `xcrun simctl` to be available.
//!
//! # Example
//!
//! ```no_run
//! use gameloop_core::simctl::Simctl;
//!
//! // List all simulators
//! let devices = Simctl::list_devices().unwrap();
//! for device in &devices {
//!     println!("{}: {} ({})", device.name, device.udid, device.state);
//! }
//!
//! // Where does the app keep its documents?
//! if let Ok(udid) = Simctl::get_booted_udid() {
//!     let data = Simctl::app_container(&udid, "com.example.game", "data").unwrap();
//!     println!("{}", data.display());
//! }
//! ```

use std::path::PathBuf;
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when interacting with simctl.
#[derive(Error, Debug)]
pub enum SimctlError {
    /// A simctl command failed to execute successfully.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// No simulator is currently in the "Booted" state.
    #[error("No booted simulator found")]
    NoBootedSimulator,

    /// The bundle is not installed on the device.
    #[error("App '{0}' is not installed on the simulator")]
    AppNotInstalled(String),

    /// Failed to parse JSON output from simctl.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// An I/O error occurred while executing the command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Represents an iOS Simulator device.
///
/// This struct contains information about a simulator device as reported
/// by `xcrun simctl list devices -j`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorDevice {
    /// The unique device identifier (UDID) for this simulator.
    pub udid: String,

    /// The human-readable name of the device (e.g., "iPhone 15 Pro").
    pub name: String,

    /// The current state of the device (e.g., "Booted", "Shutdown").
    pub state: String,

    /// The device type identifier (e.g., "com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro").
    #[serde(rename = "deviceTypeIdentifier")]
    pub device_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: std::collections::HashMap<String, Vec<SimulatorDevice>>,
}

/// Wrapper for `xcrun simctl` commands.
///
/// All methods are synchronous and execute shell commands; async callers
/// run them on the blocking pool.
pub struct Simctl;

impl Simctl {
    fn run(args: &[&str]) -> Result<Output, SimctlError> {
        let output = Command::new("xcrun").arg("simctl").args(args).output()?;
        Ok(output)
    }

    fn run_checked(args: &[&str]) -> Result<Output, SimctlError> {
        let output = Self::run(args)?;
        if !output.status.success() {
            return Err(SimctlError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output)
    }

    /// Lists all available iOS Simulator devices.
    ///
    /// Queries `xcrun simctl list devices -j` and flattens the devices of
    /// every runtime into one list.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::Io`] if the command fails to execute
    /// - [`SimctlError::CommandFailed`] if simctl returns a non-zero exit code
    /// - [`SimctlError::JsonParse`] if the output cannot be parsed as JSON
    pub fn list_devices() -> Result<Vec<SimulatorDevice>, SimctlError> {
        let output = Self::run_checked(&["list", "devices", "-j"])?;
        Self::parse_device_list(&output.stdout)
    }

    /// Returns the UDID of the first booted simulator.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::NoBootedSimulator`] if no simulator is currently booted
    /// - Any errors from [`Self::list_devices`]
    pub fn get_booted_udid() -> Result<String, SimctlError> {
        let devices = Self::list_devices()?;
        Self::find_booted_device(&devices)
            .map(|d| d.udid.clone())
            .ok_or(SimctlError::NoBootedSimulator)
    }

    /// Boots a simulator device.
    ///
    /// An already booted simulator is not treated as an error.
    pub fn boot(udid: &str) -> Result<(), SimctlError> {
        let output = Self::run(&["boot", udid])?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already booted is not an error
            if !stderr.contains("current state: Booted") {
                return Err(SimctlError::CommandFailed(stderr.to_string()));
            }
        }
        Ok(())
    }

    /// Returns a container path of an installed app.
    ///
    /// `container` is one of `app`, `data` or `groups`.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::AppNotInstalled`] if simctl cannot find the bundle
    pub fn app_container(udid: &str, bundle_id: &str, container: &str) -> Result<PathBuf, SimctlError> {
        let output = Self::run(&["get_app_container", udid, bundle_id, container])?;
        if !output.status.success() {
            return Err(SimctlError::AppNotInstalled(bundle_id.to_string()));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path.is_empty() {
            return Err(SimctlError::AppNotInstalled(bundle_id.to_string()));
        }
        Ok(PathBuf::from(path))
    }

    /// Launches an app, terminating any running instance first.
    ///
    /// Returns the pid reported by simctl, when it prints one.
    pub fn launch(udid: &str, bundle_id: &str, args: &[String]) -> Result<Option<u32>, SimctlError> {
        let mut cmd_args = vec!["launch", "--terminate-running-process", udid, bundle_id];
        cmd_args.extend(args.iter().map(String::as_str));
        let output = Self::run_checked(&cmd_args)?;
        Ok(Self::parse_launch_pid(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Opens a URL inside the simulator.
    pub fn open_url(udid: &str, url: &str) -> Result<(), SimctlError> {
        Self::run_checked(&["openurl", udid, url])?;
        Ok(())
    }

    /// Terminates a running app. An app that isn't running is not an error.
    pub fn terminate(udid: &str, bundle_id: &str) -> Result<(), SimctlError> {
        let output = Self::run(&["terminate", udid, bundle_id])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("found nothing to terminate") {
                return Err(SimctlError::CommandFailed(stderr.trim().to_string()));
            }
        }
        Ok(())
    }

    /// Reads the simulator pasteboard as text.
    pub fn pbpaste(udid: &str) -> Result<String, SimctlError> {
        let output = Self::run_checked(&["pbpaste", udid])?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Returns the simulator's `launchctl list` output.
    pub fn launchctl_list(udid: &str) -> Result<String, SimctlError> {
        let output = Self::run_checked(&["spawn", udid, "launchctl", "list"])?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Parses device list JSON into a flat vector of devices.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::JsonParse`] if the JSON is invalid or has unexpected structure
    pub fn parse_device_list(json: &[u8]) -> Result<Vec<SimulatorDevice>, SimctlError> {
        let device_list: DeviceList = serde_json::from_slice(json)?;
        let devices: Vec<SimulatorDevice> = device_list.devices
            .into_values()
            .flatten()
            .collect();
        Ok(devices)
    }

    /// Finds the first booted device in a list.
    pub fn find_booted_device(devices: &[SimulatorDevice]) -> Option<&SimulatorDevice> {
        devices.iter().find(|d| d.state == "Booted")
    }

    /// Extracts the pid from `simctl launch` output (`com.example.app: 1234`).
    pub fn parse_launch_pid(stdout: &str) -> Option<u32> {
        stdout
            .lines()
            .filter_map(|line| line.rsplit_once(':'))
            .find_map(|(_, pid)| pid.trim().parse().ok())
    }

    /// Whether a `launchctl list` listing contains a running UIKit app.
    pub fn is_app_listed(listing: &str, bundle_id: &str) -> bool {
        let label = format!("UIKitApplication:{}[", bundle_id);
        listing.lines().any(|line| line.contains(&label))
    }
}
