//! Interface to the Android Debug Bridge (`adb`).
//!
//! Wraps the device commands an Android game loop run needs: resolving an
//! installed package, starting the game loop harness for a result, stopping
//! the app, reading result files out of app storage and rebooting a device
//! the harness left in a bad state.
//!
//! # Example
//!
//! ```no_run
//! use gameloop_core::adb::Adb;
//!
//! let adb = Adb::new(Some("emulator-5554".to_string()));
//! let apk = adb.package_path("com.example.game").unwrap();
//! println!("installed at {}", apk);
//! ```

use std::process::{Command, Output};

use thiserror::Error;

/// Errors that can occur when interacting with adb.
#[derive(Error, Debug)]
pub enum AdbError {
    /// An adb command failed to execute successfully.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// The package is not installed on the device.
    #[error("Package '{0}' is not installed on the device")]
    PackageNotInstalled(String),

    /// An I/O error occurred while executing the command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wrapper for `adb` commands against one device.
///
/// With no serial, adb picks the only connected device. Methods are
/// synchronous; async callers run them on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct Adb {
    serial: Option<String>,
}

impl Adb {
    pub fn new(serial: Option<String>) -> Self {
        Self { serial }
    }

    /// Device serial, if pinned.
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Arguments that select the device (`-s <serial>`).
    pub fn device_args(&self) -> Vec<String> {
        match &self.serial {
            Some(serial) => vec!["-s".to_string(), serial.clone()],
            None => Vec::new(),
        }
    }

    /// Full `adb` argument list for a shell command.
    pub fn shell_args(&self, command: &[&str]) -> Vec<String> {
        let mut args = self.device_args();
        args.push("shell".to_string());
        args.extend(command.iter().map(|s| s.to_string()));
        args
    }

    fn shell(&self, command: &[&str]) -> Result<Output, AdbError> {
        Ok(Command::new("adb").args(self.shell_args(command)).output()?)
    }

    /// Resolves the APK path of an installed package.
    ///
    /// # Errors
    ///
    /// - [`AdbError::PackageNotInstalled`] if `pm path` prints nothing
    pub fn package_path(&self, package: &str) -> Result<String, AdbError> {
        let output = self.shell(&["pm", "path", package])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Self::parse_pm_path(&stdout).ok_or_else(|| AdbError::PackageNotInstalled(package.to_string()))
    }

    /// Arguments that run the game loop harness and wait for its result.
    ///
    /// The harness launches `package` with the game loop intent and returns
    /// only when the loop has finished.
    pub fn instrument_args(&self, harness: &str, package: &str, scenario_id: i64) -> Vec<String> {
        let scenario = scenario_id.to_string();
        let runner = format!("{}.test/androidx.test.runner.AndroidJUnitRunner", harness);
        self.shell_args(&[
            "am",
            "instrument",
            "-w",
            "-e",
            "package",
            package,
            "-e",
            "scenario",
            &scenario,
            &runner,
        ])
    }

    /// Arguments that dispatch the game loop intent straight to `package`.
    pub fn start_intent_args(&self, action: &str, package: &str, scenario_id: i64) -> Vec<String> {
        let scenario = scenario_id.to_string();
        self.shell_args(&[
            "am",
            "start",
            "-W",
            "-a",
            action,
            "-p",
            package,
            "-S",
            "--ei",
            "scenario",
            &scenario,
        ])
    }

    /// Dispatches the game loop intent and waits for the activity to start.
    pub fn start_intent(&self, action: &str, package: &str, scenario_id: i64) -> Result<(), AdbError> {
        let output = Command::new("adb")
            .args(self.start_intent_args(action, package, scenario_id))
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || stdout.contains("Error:") {
            return Err(AdbError::CommandFailed(format!(
                "{}{}",
                stdout.trim(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Stops every process of a package.
    pub fn force_stop(&self, package: &str) -> Result<(), AdbError> {
        let output = self.shell(&["am", "force-stop", package])?;
        if !output.status.success() {
            return Err(AdbError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    /// Reads a file from device storage as root (`su 0 cat <path>`).
    ///
    /// Returns `None` when the file does not exist or is empty.
    pub fn read_file(&self, path: &str) -> Result<Option<String>, AdbError> {
        let output = self.shell(&["su", "0", "cat", path])?;
        let text = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() || text.contains("No such file or directory") || text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    /// Arguments that reboot the device.
    pub fn reboot_args(&self) -> Vec<String> {
        let mut args = self.device_args();
        args.push("reboot".to_string());
        args
    }

    /// Reboots the device and blocks until adb sees it again.
    pub fn reboot(&self) -> Result<(), AdbError> {
        let output = Command::new("adb").args(self.reboot_args()).output()?;
        if !output.status.success() {
            return Err(AdbError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        let mut args = self.device_args();
        args.push("wait-for-device".to_string());
        let output = Command::new("adb").args(args).output()?;
        if !output.status.success() {
            return Err(AdbError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    /// Whether Android finished booting (`sys.boot_completed` is `1`).
    pub fn boot_completed(&self) -> Result<bool, AdbError> {
        let output = self.shell(&["getprop", "sys.boot_completed"])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "1")
    }

    /// Extracts the APK path from `pm path` output (`package:/data/app/...`).
    pub fn parse_pm_path(stdout: &str) -> Option<String> {
        stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix("package:"))
            .map(str::to_string)
            .filter(|path| !path.is_empty())
    }
}
