//! Launch session state for a single game loop run.
//!
//! A [`LaunchSession`] is created by the orchestrator for each run and owned by
//! it exclusively. Other components never mutate it; they report through the
//! completion signal channel and the session event broadcast.
//!
//! # State machine
//!
//! ```text
//! Pending ──> Launched ──> AwaitingSignal ──> Completed
//!    │                                   ├──> Failed
//!    │                                   ├──> TimedOut
//!    │                                   └──> Cancelled
//!    └──> LaunchFailed
//! ```
//!
//! Transitions are monotonic and terminal states are final. Every transition
//! is broadcast as a [`SessionEvent`] and, when a log directory is configured,
//! appended to a JSON Lines file named after the scenario, start time and
//! session id.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScenarioConfig;
use crate::signal::CompletionSignal;

/// Capacity of the session event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Sender side of the session event broadcast.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Errors from session bookkeeping.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The requested transition is not allowed from the current state.
    #[error("Illegal session transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the session was in.
        from: SessionState,
        /// State that was requested.
        to: SessionState,
    },
}

/// Lifecycle state of a launch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, target not yet launched.
    Pending,
    /// Target launch succeeded.
    Launched,
    /// Helpers armed, waiting for completion or timeout.
    AwaitingSignal,
    /// A completion signal arrived first.
    Completed,
    /// The launch-for-result call returned a failing result.
    Failed,
    /// The deadline fired first.
    TimedOut,
    /// The run was interrupted from outside.
    Cancelled,
    /// The target could not be resolved or started.
    LaunchFailed,
}

impl SessionState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::TimedOut
                | SessionState::Cancelled
                | SessionState::LaunchFailed
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Launched)
                | (Pending, LaunchFailed)
                | (Launched, AwaitingSignal)
                | (AwaitingSignal, Completed)
                | (AwaitingSignal, Failed)
                | (AwaitingSignal, TimedOut)
                | (AwaitingSignal, Cancelled)
        )
    }
}

/// Events broadcast while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged {
        /// Session identifier.
        session_id: Uuid,
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
        /// Time of the transition.
        at: DateTime<Utc>,
    },

    /// A completion signal resolved the session.
    SignalAccepted {
        /// Name of the detector that delivered it.
        source: String,
        /// The signal.
        signal: CompletionSignal,
    },

    /// A completion signal arrived after resolution and was dropped.
    SignalDiscarded {
        /// Name of the detector that delivered it.
        source: String,
        /// The signal.
        signal: CompletionSignal,
    },

    /// The dialog suppressor activated a button.
    DialogDismissed {
        /// Label of the activated button.
        label: String,
    },

    /// Diagnostics were gathered after termination.
    DiagnosticsCollected {
        /// Whether a sentinel file was found.
        sentinel: bool,
        /// Number of pasteboard entries captured.
        clipboard_entries: usize,
    },
}

/// One game loop run, from launch to terminal state.
pub struct LaunchSession {
    id: Uuid,
    config: ScenarioConfig,
    state: SessionState,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    signal: Option<CompletionSignal>,
    event_tx: EventSender,
    log_writer: Option<BufWriter<File>>,
}

impl LaunchSession {
    /// Creates a session in the [`SessionState::Pending`] state.
    ///
    /// When `log_dir` is given, events are also appended to
    /// `{log_dir}/scenario{id}_{timestamp}_{session}.jsonl`. An existing file
    /// is never overwritten.
    pub fn new(config: ScenarioConfig, event_tx: EventSender, log_dir: Option<&Path>) -> Self {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let log_writer = log_dir.and_then(|dir| {
            let name = log_file_name(config.scenario_id(), started_at, id);
            match OpenOptions::new().write(true).create_new(true).open(dir.join(&name)) {
                Ok(file) => Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(error = %e, file = %name, "cannot create session log");
                    None
                }
            }
        });

        Self {
            id,
            config,
            state: SessionState::Pending,
            started_at,
            completed_at: None,
            signal: None,
            event_tx,
            log_writer,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run configuration.
    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When the session was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the session reached its terminal state.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// The signal that completed the session, if any.
    pub fn signal(&self) -> Option<&CompletionSignal> {
        self.signal.as_ref()
    }

    /// A sender helpers can use to publish events.
    pub fn events(&self) -> EventSender {
        self.event_tx.clone()
    }

    /// Moves to `next`, broadcasting and logging the change.
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }

        let from = self.state;
        self.state = next;
        let at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(at);
            info!(session = %self.id, ?from, to = ?next, "session finished");
        } else {
            debug!(session = %self.id, ?from, to = ?next, "session transition");
        }

        self.record(SessionEvent::StateChanged {
            session_id: self.id,
            from,
            to: next,
            at,
        });
        Ok(())
    }

    /// Completes the session with the winning signal.
    pub fn complete(&mut self, source: &str, signal: CompletionSignal) -> Result<(), SessionError> {
        self.transition(SessionState::Completed)?;
        self.record(SessionEvent::SignalAccepted {
            source: source.to_string(),
            signal: signal.clone(),
        });
        self.signal = Some(signal);
        Ok(())
    }

    /// Ends the session as [`SessionState::Failed`]; the signal is kept as
    /// the evidence of the failing result.
    pub fn fail(&mut self, source: &str, signal: CompletionSignal) -> Result<(), SessionError> {
        self.transition(SessionState::Failed)?;
        self.record(SessionEvent::SignalAccepted {
            source: source.to_string(),
            signal: signal.clone(),
        });
        self.signal = Some(signal);
        Ok(())
    }

    /// Publishes an event to subscribers and the session log.
    pub fn record(&mut self, event: SessionEvent) {
        if let Some(ref mut writer) = self.log_writer {
            let written = serde_json::to_string(&event)
                .map_err(std::io::Error::from)
                .and_then(|json| writeln!(writer, "{}", json))
                .and_then(|()| writer.flush());
            if let Err(e) = written {
                warn!(session = %self.id, error = %e, "failed to write session log");
            }
        }
        // No subscribers is expected
        let _ = self.event_tx.send(event);
    }
}

fn log_file_name(scenario_id: i64, started_at: DateTime<Utc>, id: Uuid) -> String {
    format!(
        "scenario{}_{}_{}.jsonl",
        scenario_id,
        started_at.format("%Y%m%d_%H%M%S"),
        id.simple()
    )
}

impl std::fmt::Debug for LaunchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSession")
            .field("id", &self.id)
            .field("scenario_id", &self.config.scenario_id())
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .field("completed_at", &self.completed_at)
            .field("signal", &self.signal)
            .field("log_writer", &self.log_writer.as_ref().map(|_| "<BufWriter<File>>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> LaunchSession {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        LaunchSession::new(ScenarioConfig::builder(5).build(), tx, None)
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Pending);
        s.transition(SessionState::Launched).unwrap();
        s.transition(SessionState::AwaitingSignal).unwrap();
        s.complete("callback", CompletionSignal::ForegroundTransition).unwrap();
        assert_eq!(s.state(), SessionState::Completed);
        assert!(s.completed_at().is_some());
        assert_eq!(s.signal(), Some(&CompletionSignal::ForegroundTransition));
    }

    #[test]
    fn terminal_state_is_final() {
        let mut s = session();
        s.transition(SessionState::Launched).unwrap();
        s.transition(SessionState::AwaitingSignal).unwrap();
        s.transition(SessionState::TimedOut).unwrap();

        let err = s
            .complete("late", CompletionSignal::ForegroundTransition)
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::IllegalTransition {
                from: SessionState::TimedOut,
                to: SessionState::Completed,
            }
        );
        assert_eq!(s.state(), SessionState::TimedOut);
        assert!(s.signal().is_none());
    }

    #[test]
    fn launch_failure_only_from_pending() {
        let mut s = session();
        s.transition(SessionState::LaunchFailed).unwrap();
        assert!(s.state().is_terminal());

        let mut s = session();
        s.transition(SessionState::Launched).unwrap();
        assert!(s.transition(SessionState::LaunchFailed).is_err());
    }

    #[test]
    fn cannot_skip_awaiting_signal() {
        let mut s = session();
        s.transition(SessionState::Launched).unwrap();
        assert!(s.transition(SessionState::Completed).is_err());
        assert_eq!(s.state(), SessionState::Launched);
    }

    #[test]
    fn failed_keeps_the_signal() {
        let mut s = session();
        s.transition(SessionState::Launched).unwrap();
        s.transition(SessionState::AwaitingSignal).unwrap();
        s.fail("activity_result", CompletionSignal::ActivityResult { code: 1 })
            .unwrap();
        assert_eq!(s.state(), SessionState::Failed);
        assert!(s.state().is_terminal());
        assert_eq!(s.signal(), Some(&CompletionSignal::ActivityResult { code: 1 }));
        assert!(s.transition(SessionState::Completed).is_err());
    }

    #[test]
    fn cancelled_only_while_waiting() {
        let mut s = session();
        assert!(s.transition(SessionState::Cancelled).is_err());
        s.transition(SessionState::Launched).unwrap();
        s.transition(SessionState::AwaitingSignal).unwrap();
        s.transition(SessionState::Cancelled).unwrap();
        assert!(s.state().is_terminal());
    }

    #[test]
    fn transitions_are_broadcast() {
        let (tx, mut rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut s = LaunchSession::new(ScenarioConfig::builder(1).build(), tx, None);
        s.transition(SessionState::Launched).unwrap();

        match rx.try_recv().unwrap() {
            SessionEvent::StateChanged { from, to, session_id, .. } => {
                assert_eq!(from, SessionState::Pending);
                assert_eq!(to, SessionState::Launched);
                assert_eq!(session_id, s.id());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn events_are_written_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut s = LaunchSession::new(ScenarioConfig::builder(3).build(), tx, Some(dir.path()));
        s.transition(SessionState::LaunchFailed).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = entries[0].as_ref().unwrap().path();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("scenario3_"));
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("\"launch_failed\""));
    }

    #[test]
    fn sessions_started_together_get_separate_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let config = ScenarioConfig::builder(3).build();

        let mut first = LaunchSession::new(config.clone(), tx.clone(), Some(dir.path()));
        let mut second = LaunchSession::new(config, tx, Some(dir.path()));
        first.transition(SessionState::LaunchFailed).unwrap();
        second.transition(SessionState::Launched).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.contains(&first.id().simple().to_string())));
        assert!(names.iter().any(|n| n.contains(&second.id().simple().to_string())));

        for name in names {
            let contents = std::fs::read_to_string(dir.path().join(name)).unwrap();
            assert_eq!(contents.lines().count(), 1);
        }
    }
}
