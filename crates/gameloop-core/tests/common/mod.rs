//! Shared test helpers for gameloop-core integration tests.
//!
//! Mock launchers, signal sources, dialog surfaces and pasteboards that let
//! the orchestrator run without a simulator or device.

#![allow(dead_code)]

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use gameloop_core::config::ScenarioConfig;
use gameloop_core::diagnostics::{ArtifactStore, DiagnosticsError, DirectoryStore, Pasteboard};
use gameloop_core::element::UIElement;
use gameloop_core::launcher::{LaunchError, LaunchHandle, Launcher};
use gameloop_core::signal::callback::{CallbackReply, CallbackRequest};
use gameloop_core::signal::{CompletionSignal, SignalError, SignalSink, SignalSource};
use gameloop_core::suppressor::{DialogSurface, SuppressorError};

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Launcher that records calls and optionally fails to resolve the target.
pub struct MockLauncher {
    pub fail_with_not_installed: bool,
    pub artifacts: Option<PathBuf>,
    /// Shell script run as a launch-for-result child with piped stdout.
    pub result_script: Option<String>,
    /// Socket and URL the target posts to before `launch` returns.
    pub early_callback: Option<(PathBuf, String)>,
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    pub recoveries: AtomicUsize,
    pub early_replies: Arc<Mutex<Vec<CallbackReply>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            fail_with_not_installed: false,
            artifacts: None,
            result_script: None,
            early_callback: None,
            launches: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            recoveries: AtomicUsize::new(0),
            early_replies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_with_not_installed: true,
            ..Self::new()
        }
    }

    pub fn with_artifacts(dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts: Some(dir.into()),
            ..Self::new()
        }
    }

    /// Each launch starts `sh -c script` as the result child.
    pub fn with_result_script(script: &str) -> Self {
        Self {
            result_script: Some(script.to_string()),
            ..Self::new()
        }
    }

    /// Each launch posts `url` to `socket` before returning.
    pub fn posting_early(socket: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            early_callback: Some((socket.into(), url.into())),
            ..Self::new()
        }
    }

    pub fn recover_count(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }

    pub fn early_replies(&self) -> Vec<CallbackReply> {
        self.early_replies.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, config: &ScenarioConfig) -> Result<LaunchHandle, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_not_installed {
            return Err(LaunchError::AppNotInstalled(
                config.target().unwrap_or("com.example.missing").to_string(),
            ));
        }

        if let Some((socket, url)) = &self.early_callback {
            // Connecting here fails unless the listener is already bound.
            let stream = UnixStream::connect(socket).await?;
            let (reader, mut writer) = stream.into_split();
            let request = CallbackRequest::Complete { url: url.clone() };
            let json = serde_json::to_string(&request).unwrap() + "\n";
            writer.write_all(json.as_bytes()).await?;

            let replies = self.early_replies.clone();
            tokio::spawn(async move {
                let _writer = writer;
                let mut line = String::new();
                if BufReader::new(reader).read_line(&mut line).await.is_ok() {
                    if let Ok(reply) = serde_json::from_str(line.trim()) {
                        replies.lock().unwrap().push(reply);
                    }
                }
            });
        }

        let handle = LaunchHandle::new(Some(4242));
        match &self.result_script {
            Some(script) => {
                let child = Command::new("sh")
                    .args(["-c", script])
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                Ok(handle.with_result_child(child))
            }
            None => Ok(handle),
        }
    }

    async fn terminate(&self, _config: &ScenarioConfig) -> Result<(), LaunchError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self, _config: &ScenarioConfig) -> Result<(), LaunchError> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn artifact_store(&self, _config: &ScenarioConfig) -> Option<Arc<dyn ArtifactStore>> {
        self.artifacts
            .as_ref()
            .map(|dir| Arc::new(DirectoryStore::new(dir.clone())) as Arc<dyn ArtifactStore>)
    }
}

// ---------------------------------------------------------------------------
// Signal sources
// ---------------------------------------------------------------------------

/// Emits a fixed signal after a delay, counting how often it was armed.
pub struct ScriptedSource {
    pub name: &'static str,
    pub delay: Duration,
    pub signal: CompletionSignal,
    pub armed: AtomicUsize,
    /// Whether `emit` reported this source as the winner.
    pub won: Mutex<Vec<bool>>,
}

impl ScriptedSource {
    pub fn new(name: &'static str, delay: Duration, signal: CompletionSignal) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay,
            signal,
            armed: AtomicUsize::new(0),
            won: Mutex::new(Vec::new()),
        })
    }

    pub fn callback_after(delay: Duration, scenario_id: i64) -> Arc<Self> {
        Self::new(
            "url_callback",
            delay,
            CompletionSignal::UrlCallback {
                payload: format!("gameloop-complete://?scenario={}", scenario_id),
            },
        )
    }

    pub fn foreground_after(delay: Duration) -> Arc<Self> {
        Self::new("foreground", delay, CompletionSignal::ForegroundTransition)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalSource for ScriptedSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError> {
        self.armed.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.delay) => {
                let won = sink.emit(self.name, self.signal.clone());
                self.won.lock().unwrap().push(won);
            }
        }
        Ok(())
    }
}

/// Foreground detector that emits even after cancellation, so its signal
/// arrives late.
pub struct StubbornSource {
    pub delay: Duration,
}

#[async_trait]
impl SignalSource for StubbornSource {
    fn name(&self) -> &'static str {
        "foreground"
    }

    async fn detect(&self, sink: SignalSink, _cancel: CancellationToken) -> Result<(), SignalError> {
        tokio::time::sleep(self.delay).await;
        sink.emit(self.name(), CompletionSignal::ForegroundTransition);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dialog surface
// ---------------------------------------------------------------------------

/// Surface that shows a fixed set of buttons and records activations.
pub struct MockSurface {
    pub buttons: Mutex<Vec<UIElement>>,
    pub activated: Mutex<Vec<String>>,
    pub scans: AtomicUsize,
}

impl MockSurface {
    pub fn with_buttons(labels: &[&str]) -> Arc<Self> {
        let buttons = labels
            .iter()
            .map(|label| UIElement {
                label: Some(label.to_string()),
                element_type: Some("Button".to_string()),
                ..Default::default()
            })
            .collect();
        Arc::new(Self {
            buttons: Mutex::new(buttons),
            activated: Mutex::new(Vec::new()),
            scans: AtomicUsize::new(0),
        })
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn activated(&self) -> Vec<String> {
        self.activated.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogSurface for MockSurface {
    async fn scan(&self) -> Result<Vec<UIElement>, SuppressorError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self.buttons.lock().unwrap().clone())
    }

    async fn activate(&self, element: &UIElement) -> Result<(), SuppressorError> {
        let label = element.label.clone().unwrap_or_default();
        self.activated.lock().unwrap().push(label.clone());
        self.buttons
            .lock()
            .unwrap()
            .retain(|b| b.label.as_deref() != Some(label.as_str()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pasteboard
// ---------------------------------------------------------------------------

/// Pasteboard with fixed contents.
pub struct MockPasteboard(pub Option<String>);

#[async_trait]
impl Pasteboard for MockPasteboard {
    async fn read(&self) -> Result<Option<String>, DiagnosticsError> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Unique session name
// ---------------------------------------------------------------------------

/// Generate a unique session name for test isolation.
pub fn unique_session_name() -> String {
    format!(
        "test_{}",
        uuid::Uuid::new_v4().to_string().replace('-', "")[..8].to_string()
    )
}
