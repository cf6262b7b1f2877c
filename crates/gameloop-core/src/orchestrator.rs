//! The game loop run driver.
//!
//! [`Orchestrator`] composes the other components into one run:
//!
//! 1. prepare the signal sources, so a target that reports early is heard
//! 2. launch the target through a [`Launcher`]; on failure the session ends
//!    `LaunchFailed` at once and no helper is started
//! 3. start the dialog suppressor and arm the completion signal channel
//! 4. race the channel against the timeout and the caller's token in the
//!    [`WaitEngine`]
//! 5. judge the winning signal, stop every helper, collect diagnostics once,
//!    terminate the target
//!
//! A launch-for-result return only passes with exit code 0 and no harness
//! failure marker in its output; otherwise the session ends `Failed`.
//! Cancelling the caller's token ends the wait with `Cancelled`, and the
//! run still collects diagnostics and terminates the target before
//! returning.
//!
//! The [`LaunchSession`] is owned by the run and only mutated here, after
//! the race has resolved. Progress is published as [`SessionEvent`]s on a
//! broadcast channel (see [`Orchestrator::subscribe`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gameloop_core::config::ScenarioConfig;
//! use gameloop_core::launcher::ProcessLauncher;
//! use gameloop_core::orchestrator::Orchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ScenarioConfig::builder(1).target("./my-game").build();
//!     let cancel = CancellationToken::new();
//!     let result = Orchestrator::new(Arc::new(ProcessLauncher::new()))
//!         .run(&config, &cancel)
//!         .await;
//!     println!("passed: {}", result.passed());
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ScenarioConfig;
use crate::diagnostics::{DiagnosticBundle, DiagnosticsCollector, Pasteboard};
use crate::launcher::Launcher;
use crate::session::{
    EventSender, LaunchSession, SessionEvent, SessionState, EVENT_CHANNEL_CAPACITY,
};
use crate::signal::activity::ActivityResultSource;
use crate::signal::{CompletionSignal, SignalChannel, SignalSource};
use crate::suppressor::{DialogSuppressor, DialogSurface};
use crate::validation::{harness_failure, output_tail};
use crate::wait::{WaitEngine, WaitOutcome};

/// Why a run did not pass.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    /// The target could not be resolved or started.
    #[error("LaunchFailed: {reason}")]
    LaunchFailed {
        /// The launcher's error.
        reason: String,
    },

    /// The launch-for-result call returned a failing result.
    #[error("ResultFailed: {reason}")]
    ResultFailed {
        /// Exit code of the result child.
        code: i32,
        /// The harness failure line, or the exit code.
        reason: String,
    },

    /// No completion signal arrived in time.
    #[error("TimedOut: no completion signal within {timeout:?}")]
    TimedOut {
        /// The configured timeout.
        timeout: Duration,
    },

    /// The caller cancelled the run before a signal arrived.
    #[error("Cancelled: run interrupted while awaiting completion")]
    Cancelled,
}

/// Judges a launch-for-result return. Other signals always pass.
fn result_failure(signal: &CompletionSignal, output: Option<&str>) -> Option<RunFailure> {
    let CompletionSignal::ActivityResult { code } = signal else {
        return None;
    };
    let code = *code;
    if let Some(line) = output.and_then(harness_failure) {
        return Some(RunFailure::ResultFailed { code, reason: line });
    }
    (code != 0).then(|| RunFailure::ResultFailed {
        code,
        reason: format!("result exited with code {}", code),
    })
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub session_id: Uuid,
    pub scenario_id: i64,
    /// Terminal session state.
    pub state: SessionState,
    /// The signal that completed the run.
    pub signal: Option<CompletionSignal>,
    pub failure: Option<RunFailure>,
    pub diagnostics: DiagnosticBundle,
    /// Number of attempts made, including this one.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Completion marker, present only when the run completed.
    pub marker: Option<String>,
}

impl RunResult {
    fn from_session(
        session: &LaunchSession,
        failure: Option<RunFailure>,
        diagnostics: DiagnosticBundle,
        attempts: u32,
    ) -> Self {
        let marker = (session.state() == SessionState::Completed)
            .then(|| session.config().constants().completion_marker.clone());
        Self {
            session_id: session.id(),
            scenario_id: session.config().scenario_id(),
            state: session.state(),
            signal: session.signal().cloned(),
            failure,
            diagnostics,
            attempts,
            started_at: session.started_at(),
            completed_at: session.completed_at(),
            marker,
        }
    }

    /// Whether the run completed.
    pub fn passed(&self) -> bool {
        self.state == SessionState::Completed
    }

    /// Human-readable failure reason.
    pub fn failure_reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    /// Whether another attempt could change the outcome.
    ///
    /// A completed run is retried when its summary is incomplete or when the
    /// target has an artifact location but wrote no sentinel file there.
    fn retryable(&self) -> bool {
        match self.state {
            SessionState::TimedOut | SessionState::Failed => true,
            SessionState::Completed => {
                self.diagnostics.sentinel_missing()
                    || self
                        .diagnostics
                        .summary
                        .as_ref()
                        .map_or(false, |summary| !summary.complete)
            }
            _ => false,
        }
    }
}

/// Drives game loop runs.
pub struct Orchestrator {
    launcher: Arc<dyn Launcher>,
    signals: SignalChannel,
    dialog_surface: Option<Arc<dyn DialogSurface>>,
    pasteboard: Option<Arc<dyn Pasteboard>>,
    log_dir: Option<PathBuf>,
    events: EventSender,
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            launcher,
            signals: SignalChannel::new(),
            dialog_surface: None,
            pasteboard: None,
            log_dir: None,
            events,
        }
    }

    /// Adds a completion signal source armed on every run.
    pub fn with_signal_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.signals.push(source);
        self
    }

    /// Enables dialog suppression on the given surface.
    pub fn with_dialog_surface(mut self, surface: Arc<dyn DialogSurface>) -> Self {
        self.dialog_surface = Some(surface);
        self
    }

    /// Reads this pasteboard during diagnostics.
    pub fn with_pasteboard(mut self, pasteboard: Arc<dyn Pasteboard>) -> Self {
        self.pasteboard = Some(pasteboard);
        self
    }

    /// Writes each session's events to a JSON Lines file in `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Subscribes to session events of subsequent runs.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Names of the configured signal sources.
    pub fn signal_sources(&self) -> Vec<&'static str> {
        self.signals.source_names()
    }

    /// Runs the scenario once.
    ///
    /// Cancelling `cancel` ends the wait early; the target is still
    /// terminated and diagnostics collected before this returns.
    pub async fn run(&self, config: &ScenarioConfig, cancel: &CancellationToken) -> RunResult {
        self.run_attempt(config, 1, cancel).await
    }

    /// Runs the scenario, retrying up to `max_attempts` times in total.
    ///
    /// Timed-out, failed and incomplete runs are retried; a failed run is
    /// followed by [`Launcher::recover`]. Launch failures and cancelled runs
    /// are not retried.
    pub async fn run_with_retry(
        &self,
        config: &ScenarioConfig,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> RunResult {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.run_attempt(config, attempt, cancel).await;
            if attempt >= max_attempts || !result.retryable() || cancel.is_cancelled() {
                return result;
            }
            if result.state == SessionState::Failed {
                if let Err(e) = self.launcher.recover(config).await {
                    warn!(error = %e, "device recovery failed");
                }
            }
            info!(attempt, max_attempts, state = ?result.state, "retrying game loop");
            attempt += 1;
        }
    }

    async fn run_attempt(
        &self,
        config: &ScenarioConfig,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> RunResult {
        let span = info_span!(
            "gameloop_run",
            scenario = config.scenario_id(),
            launcher = self.launcher.name(),
            attempt
        );
        self.run_inner(config, attempt, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        config: &ScenarioConfig,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> RunResult {
        let mut session = LaunchSession::new(config.clone(), self.events.clone(), self.log_dir.as_deref());
        info!(session = %session.id(), timeout = ?config.timeout(), "starting game loop");

        self.signals.prepare().await;
        let mut handle = match self.launcher.launch(config).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "launch failed");
                self.signals.release().await;
                Self::advance(&mut session, SessionState::LaunchFailed);
                let diagnostics = self.collect(&mut session).await;
                return RunResult::from_session(
                    &session,
                    Some(RunFailure::LaunchFailed { reason: e.to_string() }),
                    diagnostics,
                    attempt,
                );
            }
        };
        Self::advance(&mut session, SessionState::Launched);
        Self::advance(&mut session, SessionState::AwaitingSignal);

        let helpers = cancel.child_token();
        let mut channel = self.signals.clone();
        let result_source: Option<Arc<ActivityResultSource>> =
            handle.take_result_source().map(Arc::new);
        if let Some(source) = &result_source {
            channel.push(source.clone());
        }

        let constants = config.constants();
        let mut suppressor = match &self.dialog_surface {
            Some(surface) if !config.timeout().is_zero() => Some(DialogSuppressor::spawn(
                surface.clone(),
                constants.dialog_labels.clone(),
                constants.dialog_interval(),
                helpers.child_token(),
                Some(session.events()),
            )),
            _ => None,
        };

        let outcome = WaitEngine::new(config.timeout())
            .race(&channel, cancel, Some(session.events()))
            .await;

        if let Some(suppressor) = suppressor.as_mut() {
            suppressor.stop().await;
        }
        helpers.cancel();
        drop(channel);
        self.signals.release().await;

        let result_output = result_source.as_ref().and_then(|source| source.output());
        let failure = match outcome {
            WaitOutcome::Completed(delivery) => {
                match result_failure(&delivery.signal, result_output.as_deref()) {
                    None => {
                        if let Err(e) = session.complete(&delivery.source, delivery.signal) {
                            warn!(error = %e, "could not record completion");
                        }
                        None
                    }
                    Some(failure) => {
                        warn!(reason = %failure, "target returned a failing result");
                        if let Err(e) = session.fail(&delivery.source, delivery.signal) {
                            warn!(error = %e, "could not record failed result");
                        }
                        Some(failure)
                    }
                }
            }
            WaitOutcome::TimedOut => {
                Self::advance(&mut session, SessionState::TimedOut);
                Some(RunFailure::TimedOut {
                    timeout: config.timeout(),
                })
            }
            WaitOutcome::Cancelled => {
                warn!("run cancelled while awaiting completion");
                Self::advance(&mut session, SessionState::Cancelled);
                Some(RunFailure::Cancelled)
            }
        };

        let mut diagnostics = self.collect(&mut session).await;
        diagnostics.result_output = result_output
            .as_deref()
            .map(output_tail)
            .filter(|tail| !tail.is_empty());

        if let Err(e) = self.launcher.terminate(config).await {
            warn!(error = %e, "failed to terminate target");
        }

        let result = RunResult::from_session(&session, failure, diagnostics, attempt);
        match &result.marker {
            Some(marker) => info!(%marker, "game loop passed"),
            None => info!(reason = ?result.failure_reason(), "game loop failed"),
        }
        result
    }

    fn advance(session: &mut LaunchSession, next: SessionState) {
        if let Err(e) = session.transition(next) {
            warn!(error = %e, "session transition rejected");
        }
    }

    async fn collect(&self, session: &mut LaunchSession) -> DiagnosticBundle {
        let config = session.config().clone();
        let store = self.launcher.artifact_store(&config).await;
        let bundle = DiagnosticsCollector::new(store, self.pasteboard.clone())
            .collect(&config)
            .await;
        session.record(SessionEvent::DiagnosticsCollected {
            sentinel: bundle.sentinel_text.is_some(),
            clipboard_entries: bundle.clipboard_entries.len(),
        });
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::TestSummary;

    fn result(state: SessionState, summary: Option<TestSummary>) -> RunResult {
        with_bundle(
            state,
            DiagnosticBundle {
                summary,
                ..DiagnosticBundle::empty()
            },
        )
    }

    fn with_bundle(state: SessionState, diagnostics: DiagnosticBundle) -> RunResult {
        RunResult {
            session_id: Uuid::new_v4(),
            scenario_id: 1,
            state,
            signal: None,
            failure: None,
            diagnostics,
            attempts: 1,
            started_at: Utc::now(),
            completed_at: None,
            marker: None,
        }
    }

    #[test]
    fn retry_policy() {
        assert!(result(SessionState::TimedOut, None).retryable());
        assert!(result(SessionState::Failed, None).retryable());
        assert!(!result(SessionState::LaunchFailed, None).retryable());
        assert!(!result(SessionState::Cancelled, None).retryable());
        assert!(!result(SessionState::Completed, None).retryable());

        let incomplete = TestSummary::default();
        assert!(result(SessionState::Completed, Some(incomplete)).retryable());

        let complete = TestSummary {
            complete: true,
            ..TestSummary::default()
        };
        assert!(!result(SessionState::Completed, Some(complete)).retryable());
    }

    #[test]
    fn missing_sentinel_is_retried() {
        let missing = DiagnosticBundle {
            artifact_location: Some("/data/local/tmp/gameloop".into()),
            ..DiagnosticBundle::empty()
        };
        assert!(with_bundle(SessionState::Completed, missing).retryable());

        let written = DiagnosticBundle {
            artifact_location: Some("/data/local/tmp/gameloop".into()),
            sentinel_text: Some("done".into()),
            ..DiagnosticBundle::empty()
        };
        assert!(!with_bundle(SessionState::Completed, written).retryable());
    }

    #[test]
    fn result_codes_and_harness_output_are_judged() {
        let ok = CompletionSignal::ActivityResult { code: 0 };
        assert_eq!(result_failure(&ok, None), None);
        assert_eq!(result_failure(&ok, Some("OK (3 tests)")), None);

        let crashed = CompletionSignal::ActivityResult { code: -1 };
        assert!(matches!(
            result_failure(&crashed, None),
            Some(RunFailure::ResultFailed { code: -1, .. })
        ));

        let failure = result_failure(&ok, Some("Tests run: 2,  Failures: 1\nFAILURES!!!\n")).unwrap();
        assert_eq!(
            failure,
            RunFailure::ResultFailed {
                code: 0,
                reason: "FAILURES!!!".into()
            }
        );
    }

    #[test]
    fn failure_reasons_name_the_state() {
        let failure = RunFailure::TimedOut {
            timeout: Duration::from_secs(1),
        };
        assert!(failure.to_string().starts_with("TimedOut"));
        let failure = RunFailure::LaunchFailed { reason: "x".into() };
        assert!(failure.to_string().starts_with("LaunchFailed"));
        assert!(RunFailure::Cancelled.to_string().starts_with("Cancelled"));
    }
}
