//! Side-channel evidence gathered after a run ends.
//!
//! The target cannot hand results back to the orchestrator, so once a session
//! reaches a terminal state the [`DiagnosticsCollector`] reads what the app
//! left behind:
//!
//! - the per-scenario sentinel file (`results_scenario_<id>.json`) from an
//!   [`ArtifactStore`], verbatim
//! - the pasteboard text, split into non-blank entries
//! - a test runner summary, when the sentinel text contains one
//!
//! The orchestrator adds the tail of a launch-for-result child's output
//! (the `am instrument` report) to the bundle when one was captured.
//!
//! Collection never fails. Every error is logged and becomes a missing field.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::adb::Adb;
use crate::config::ScenarioConfig;
use crate::simctl::Simctl;
use crate::validation::{detect_summary, TestSummary};

/// Errors from reading diagnostics sources.
#[derive(Error, Debug)]
pub enum DiagnosticsError {
    /// An I/O error occurred while reading an artifact.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A device tool failed.
    #[error("Command failed: {0}")]
    Command(String),

    /// The system clipboard could not be read.
    #[error("Clipboard error: {0}")]
    Clipboard(String),
}

/// A shared pasteboard the target may write to.
#[async_trait]
pub trait Pasteboard: Send + Sync {
    /// Current text contents, or `None` when there is no text.
    async fn read(&self) -> Result<Option<String>, DiagnosticsError>;
}

/// Where the target leaves its result files.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Reads a file as text. A missing file is `Ok(None)`.
    async fn read_text(&self, name: &str) -> Result<Option<String>, DiagnosticsError>;
}

/// Artifacts in a host directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArtifactStore for DirectoryStore {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    async fn read_text(&self, name: &str) -> Result<Option<String>, DiagnosticsError> {
        match tokio::fs::read_to_string(self.dir.join(name)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Artifacts in Android app storage, read over adb.
#[derive(Debug, Clone)]
pub struct AdbStore {
    adb: Adb,
    dir: String,
}

impl AdbStore {
    /// Files the game loop harness stored for `package`.
    pub fn for_harness(adb: Adb, harness: &str, package: &str) -> Self {
        Self {
            adb,
            dir: format!("/data/data/{}/files/{}", harness, package),
        }
    }

    /// Files in the app's own `files/` directory.
    pub fn for_app(adb: Adb, package: &str) -> Self {
        Self {
            adb,
            dir: format!("/data/data/{}/files", package),
        }
    }
}

#[async_trait]
impl ArtifactStore for AdbStore {
    fn describe(&self) -> String {
        format!("adb:{}", self.dir)
    }

    async fn read_text(&self, name: &str) -> Result<Option<String>, DiagnosticsError> {
        let adb = self.adb.clone();
        let path = format!("{}/{}", self.dir, name);
        tokio::task::spawn_blocking(move || adb.read_file(&path))
            .await
            .map_err(|e| DiagnosticsError::Command(e.to_string()))?
            .map_err(|e| DiagnosticsError::Command(e.to_string()))
    }
}

/// Pasteboard of a simulator (`xcrun simctl pbpaste`).
#[derive(Debug, Clone)]
pub struct SimctlPasteboard {
    udid: String,
}

impl SimctlPasteboard {
    pub fn new(udid: impl Into<String>) -> Self {
        Self { udid: udid.into() }
    }
}

#[async_trait]
impl Pasteboard for SimctlPasteboard {
    async fn read(&self) -> Result<Option<String>, DiagnosticsError> {
        let udid = self.udid.clone();
        let text = tokio::task::spawn_blocking(move || Simctl::pbpaste(&udid))
            .await
            .map_err(|e| DiagnosticsError::Command(e.to_string()))?
            .map_err(|e| DiagnosticsError::Command(e.to_string()))?;
        Ok(Some(text).filter(|t| !t.is_empty()))
    }
}

/// The host system clipboard, for targets running as local processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPasteboard;

#[async_trait]
impl Pasteboard for SystemPasteboard {
    async fn read(&self) -> Result<Option<String>, DiagnosticsError> {
        tokio::task::spawn_blocking(|| {
            let mut clipboard =
                arboard::Clipboard::new().map_err(|e| DiagnosticsError::Clipboard(e.to_string()))?;
            match clipboard.get_text() {
                Ok(text) => Ok(Some(text)),
                Err(arboard::Error::ContentNotAvailable) => Ok(None),
                Err(e) => Err(DiagnosticsError::Clipboard(e.to_string())),
            }
        })
        .await
        .map_err(|e| DiagnosticsError::Clipboard(e.to_string()))?
    }
}

/// Evidence collected once, after the session reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    /// Sentinel file contents, verbatim.
    pub sentinel_text: Option<String>,
    /// Non-blank pasteboard lines, in order.
    pub clipboard_entries: Vec<String>,
    /// Test runner summary found in the sentinel text.
    pub summary: Option<TestSummary>,
    /// Where the sentinel was looked for; `None` when the launcher has no
    /// artifact store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_location: Option<String>,
    /// Last lines the launch-for-result child printed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_output: Option<String>,
    pub collected_at: DateTime<Utc>,
}

impl DiagnosticBundle {
    /// A bundle with nothing in it.
    pub fn empty() -> Self {
        Self {
            sentinel_text: None,
            clipboard_entries: Vec::new(),
            summary: None,
            artifact_location: None,
            result_output: None,
            collected_at: Utc::now(),
        }
    }

    /// Whether an artifact store was searched and held no sentinel.
    pub fn sentinel_missing(&self) -> bool {
        self.artifact_location.is_some() && self.sentinel_text.is_none()
    }

    /// Whether nothing was found.
    pub fn is_empty(&self) -> bool {
        self.sentinel_text.is_none() && self.clipboard_entries.is_empty()
    }
}

/// Splits pasteboard text into non-blank entries.
pub fn pasteboard_entries(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads diagnostics from the configured sources.
#[derive(Clone, Default)]
pub struct DiagnosticsCollector {
    store: Option<Arc<dyn ArtifactStore>>,
    pasteboard: Option<Arc<dyn Pasteboard>>,
}

impl DiagnosticsCollector {
    pub fn new(store: Option<Arc<dyn ArtifactStore>>, pasteboard: Option<Arc<dyn Pasteboard>>) -> Self {
        Self { store, pasteboard }
    }

    /// Collects the bundle for `config`. Never fails.
    pub async fn collect(&self, config: &ScenarioConfig) -> DiagnosticBundle {
        let sentinel_text = self.read_sentinel(config).await;
        let clipboard_entries = self.read_pasteboard().await;
        let summary = sentinel_text.as_deref().and_then(detect_summary);

        info!(
            sentinel = sentinel_text.is_some(),
            clipboard_entries = clipboard_entries.len(),
            "diagnostics collected"
        );

        DiagnosticBundle {
            sentinel_text,
            clipboard_entries,
            summary,
            artifact_location: self.store.as_ref().map(|store| store.describe()),
            result_output: None,
            collected_at: Utc::now(),
        }
    }

    async fn read_sentinel(&self, config: &ScenarioConfig) -> Option<String> {
        let store = self.store.as_ref()?;
        let name = config.sentinel_file_name();
        match store.read_text(&name).await {
            Ok(Some(text)) => Some(text),
            Ok(None) => {
                debug!(file = %name, store = %store.describe(), "no sentinel file");
                None
            }
            Err(e) => {
                debug!(file = %name, store = %store.describe(), error = %e, "sentinel unreadable");
                None
            }
        }
    }

    async fn read_pasteboard(&self) -> Vec<String> {
        let Some(pasteboard) = self.pasteboard.as_ref() else {
            return Vec::new();
        };
        match pasteboard.read().await {
            Ok(Some(text)) => pasteboard_entries(&text),
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!(error = %e, "pasteboard unreadable");
                Vec::new()
            }
        }
    }
}
