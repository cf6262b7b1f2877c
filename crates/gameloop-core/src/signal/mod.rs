//! Completion signal detection.
//!
//! A target application cannot return a value to the orchestrator, so the end
//! of a scenario is observed through whichever platform channels are
//! available. Each channel is a [`SignalSource`] that only detects and emits;
//! a [`SignalChannel`] arms a set of sources and resolves with the first
//! [`CompletionSignal`] any of them delivers.
//!
//! # Sources
//!
//! - [`callback::UrlCallbackSource`] - completion URL posted to a Unix socket
//! - [`notification::NotificationSource`] - named inter-process notification
//! - [`foreground::ForegroundSource`] - harness back in the foreground, confirmed
//! - [`activity::ActivityResultSource`] - launch-for-result child exits
//!
//! # Delivery
//!
//! Sources that must exist before the target starts (a listening socket)
//! acquire them in [`SignalSource::prepare`], which the orchestrator calls
//! before launching. Everything else happens once the channel is armed.
//!
//! All sources of an armed channel share one [`SignalSink`] wrapping a
//! oneshot sender. The first emit takes the sender and resolves the channel;
//! later emits are logged as a signal race anomaly and discarded. Emits after
//! the channel is closed are discarded as late events.

pub mod activity;
pub mod callback;
pub mod foreground;
pub mod notification;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::session::{EventSender, SessionEvent};

/// Time granted to sources to exit after cancellation before they are aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// A normalized completion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionSignal {
    /// The target invoked the completion URL.
    UrlCallback {
        /// The URL as received.
        payload: String,
    },
    /// A named inter-process notification was delivered.
    ProcessNotification {
        /// Notification name.
        name: String,
    },
    /// The harness returned to the foreground and completion was confirmed.
    ForegroundTransition,
    /// The launch-for-result call returned.
    ActivityResult {
        /// Result code (`-1` when the process was killed by a signal).
        code: i32,
    },
}

impl CompletionSignal {
    /// Short name of the signal variant.
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionSignal::UrlCallback { .. } => "url_callback",
            CompletionSignal::ProcessNotification { .. } => "process_notification",
            CompletionSignal::ForegroundTransition => "foreground_transition",
            CompletionSignal::ActivityResult { .. } => "activity_result",
        }
    }
}

/// Errors a source can hit while detecting.
#[derive(Error, Debug)]
pub enum SignalError {
    /// An I/O error occurred (socket, child process).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A watcher process ended without observing the signal.
    #[error("Signal watcher failed: {0}")]
    WatcherFailed(String),

    /// A foreground probe could not answer.
    #[error("Probe failed: {0}")]
    Probe(String),

    /// A callback URL could not be parsed.
    #[error("Invalid callback URL: {0}")]
    InvalidUrl(String),

    /// Another run is already listening on the callback socket.
    #[error("Callback socket {0} is in use by another run")]
    SocketInUse(std::path::PathBuf),
}

/// A signal as delivered, tagged with the detector that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Name of the source that emitted the signal.
    pub source: String,
    /// The signal.
    pub signal: CompletionSignal,
}

struct SinkState {
    tx: Option<oneshot::Sender<Delivery>>,
    closed: bool,
}

/// Shared, single-resolution emitter handed to every source of an armed channel.
#[derive(Clone)]
pub struct SignalSink {
    state: Arc<Mutex<SinkState>>,
    events: Option<EventSender>,
}

impl SignalSink {
    fn new(tx: oneshot::Sender<Delivery>, events: Option<EventSender>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                tx: Some(tx),
                closed: false,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Emits a signal. Returns `true` only for the signal that resolved the channel.
    pub fn emit(&self, source: &str, signal: CompletionSignal) -> bool {
        let mut state = self.lock();

        if state.closed {
            debug!(source, kind = signal.kind(), "discarding late signal");
            drop(state);
            self.publish_discarded(source, signal);
            return false;
        }

        let tx = state.tx.take();
        match tx {
            Some(tx) => {
                let delivery = Delivery {
                    source: source.to_string(),
                    signal,
                };
                match tx.send(delivery) {
                    Ok(()) => {
                        info!(source, "completion signal received");
                        true
                    }
                    Err(delivery) => {
                        debug!(source, "signal receiver gone; discarding");
                        drop(state);
                        self.publish_discarded(source, delivery.signal);
                        false
                    }
                }
            }
            None => {
                warn!(
                    anomaly = "SignalRaceAnomaly",
                    source,
                    kind = signal.kind(),
                    "additional completion signal ignored; first signal wins"
                );
                drop(state);
                self.publish_discarded(source, signal);
                false
            }
        }
    }

    /// Whether a signal already resolved the channel.
    pub fn is_resolved(&self) -> bool {
        self.lock().tx.is_none()
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.tx = None;
    }

    fn publish_discarded(&self, source: &str, signal: CompletionSignal) {
        if let Some(ref events) = self.events {
            let _ = events.send(SessionEvent::SignalDiscarded {
                source: source.to_string(),
                signal,
            });
        }
    }
}

/// A completion detector.
///
/// Implementations watch one platform channel and call [`SignalSink::emit`]
/// when they observe completion. `detect` must return promptly once `cancel`
/// fires.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Short name used in logs and deliveries.
    fn name(&self) -> &'static str;

    /// Acquires whatever the target may reach for as soon as it starts.
    /// Called before launch.
    async fn prepare(&self) -> Result<(), SignalError> {
        Ok(())
    }

    /// Gives back what `prepare` acquired when the source will not be armed.
    async fn release(&self) {}

    /// Watches for completion until a signal is emitted or `cancel` fires.
    async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError>;
}

/// The set of sources armed for each run.
#[derive(Clone, Default)]
pub struct SignalChannel {
    sources: Vec<Arc<dyn SignalSource>>,
}

impl SignalChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source (builder form).
    pub fn with_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds a source.
    pub fn push(&mut self, source: Arc<dyn SignalSource>) {
        self.sources.push(source);
    }

    /// Number of configured sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no sources are configured.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Names of the configured sources.
    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Prepares every source. Failures are logged; the source then sets up
    /// late, when armed.
    pub async fn prepare(&self) {
        for source in &self.sources {
            if let Err(e) = source.prepare().await {
                warn!(source = source.name(), error = %e, "signal source not prepared");
            }
        }
    }

    /// Releases what [`SignalChannel::prepare`] acquired.
    pub async fn release(&self) {
        for source in &self.sources {
            source.release().await;
        }
    }

    /// Spawns every source and returns the armed channel.
    ///
    /// Sources run until one emits, they finish on their own, or `cancel`
    /// (or [`ArmedChannel::close`]) stops them.
    pub fn arm(&self, cancel: CancellationToken, events: Option<EventSender>) -> ArmedChannel {
        let (tx, rx) = oneshot::channel();
        let sink = SignalSink::new(tx, events);
        let mut tasks = JoinSet::new();

        for source in &self.sources {
            let source = source.clone();
            let sink = sink.clone();
            let token = cancel.clone();
            let span = info_span!("signal_source", source = source.name());
            tasks.spawn(
                async move {
                    if let Err(e) = source.detect(sink, token).await {
                        warn!(error = %e, "signal source stopped");
                    }
                }
                .instrument(span),
            );
        }

        ArmedChannel {
            rx,
            sink,
            cancel,
            tasks,
            done: false,
        }
    }
}

/// Running sources plus the receiving end of their shared sink.
pub struct ArmedChannel {
    rx: oneshot::Receiver<Delivery>,
    sink: SignalSink,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    done: bool,
}

impl ArmedChannel {
    /// Waits for the first delivered signal.
    ///
    /// Returns `None` once every source has exited without emitting, or if a
    /// delivery was already consumed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if self.done {
            return None;
        }
        loop {
            if self.tasks.is_empty() {
                self.done = true;
                return self.rx.try_recv().ok();
            }
            tokio::select! {
                biased;
                delivery = &mut self.rx => {
                    self.done = true;
                    return delivery.ok();
                }
                joined = self.tasks.join_next() => {
                    if let Some(Err(e)) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "signal source panicked");
                        }
                    }
                }
            }
        }
    }

    /// Takes a delivery that is already available, without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(delivery) => {
                self.done = true;
                Some(delivery)
            }
            Err(_) => None,
        }
    }

    /// Stops all sources. Signals emitted from now on are discarded.
    pub async fn close(&mut self) {
        self.sink.close();
        self.cancel.cancel();

        let drained = tokio::time::timeout(CLOSE_GRACE, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "signal sources ignored cancellation; aborting");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

impl Drop for ArmedChannel {
    fn drop(&mut self) {
        self.sink.close();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Emits {
        delay: Duration,
        signal: CompletionSignal,
    }

    #[async_trait]
    impl SignalSource for Emits {
        fn name(&self) -> &'static str {
            "emits"
        }

        async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError> {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.delay) => {
                    sink.emit(self.name(), self.signal.clone());
                }
            }
            Ok(())
        }
    }

    struct GivesUp;

    #[async_trait]
    impl SignalSource for GivesUp {
        fn name(&self) -> &'static str {
            "gives-up"
        }

        async fn detect(&self, _sink: SignalSink, _cancel: CancellationToken) -> Result<(), SignalError> {
            Err(SignalError::WatcherFailed("no watcher".into()))
        }
    }

    #[test]
    fn sink_first_emit_wins() {
        let (tx, mut rx) = oneshot::channel();
        let sink = SignalSink::new(tx, None);

        assert!(sink.emit("a", CompletionSignal::ActivityResult { code: 0 }));
        assert!(sink.is_resolved());
        assert!(!sink.emit("b", CompletionSignal::ForegroundTransition));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.source, "a");
        assert_eq!(delivery.signal, CompletionSignal::ActivityResult { code: 0 });
    }

    #[test]
    fn sink_discards_after_close() {
        let (tx, mut rx) = oneshot::channel();
        let (events, mut events_rx) = tokio::sync::broadcast::channel(8);
        let sink = SignalSink::new(tx, Some(events));

        sink.close();
        assert!(!sink.emit("late", CompletionSignal::ForegroundTransition));
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            SessionEvent::SignalDiscarded { ref source, .. } if source == "late"
        ));
    }

    #[test]
    fn signal_kind_names() {
        assert_eq!(CompletionSignal::ForegroundTransition.kind(), "foreground_transition");
        assert_eq!(
            CompletionSignal::UrlCallback { payload: "x".into() }.kind(),
            "url_callback"
        );
    }

    #[test]
    fn signal_serializes_with_kind_tag() {
        let json = serde_json::to_string(&CompletionSignal::ActivityResult { code: 3 }).unwrap();
        assert_eq!(json, r#"{"kind":"activity_result","code":3}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_channel_resolves_with_earliest() {
        let channel = SignalChannel::new()
            .with_source(Arc::new(Emits {
                delay: Duration::from_secs(2),
                signal: CompletionSignal::ForegroundTransition,
            }))
            .with_source(Arc::new(Emits {
                delay: Duration::from_secs(1),
                signal: CompletionSignal::UrlCallback { payload: "first".into() },
            }));

        let mut armed = channel.arm(CancellationToken::new(), None);
        let delivery = armed.recv().await.unwrap();
        assert_eq!(
            delivery.signal,
            CompletionSignal::UrlCallback { payload: "first".into() }
        );
        armed.close().await;
        assert!(armed.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn armed_channel_reports_exhaustion() {
        let channel = SignalChannel::new().with_source(Arc::new(GivesUp));
        let mut armed = channel.arm(CancellationToken::new(), None);
        assert!(armed.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_channel_is_exhausted_immediately() {
        let mut armed = SignalChannel::new().arm(CancellationToken::new(), None);
        assert!(armed.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_sources() {
        let channel = SignalChannel::new().with_source(Arc::new(Emits {
            delay: Duration::from_secs(3600),
            signal: CompletionSignal::ForegroundTransition,
        }));
        let token = CancellationToken::new();
        let mut armed = channel.arm(token.clone(), None);
        armed.close().await;
        assert!(token.is_cancelled());
        assert!(armed.try_recv().is_none());
    }
}
