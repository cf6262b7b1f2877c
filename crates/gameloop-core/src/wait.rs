//! Bounded wait for the completion signal.
//!
//! [`WaitEngine::race`] arms a [`SignalChannel`] and races it against the
//! run deadline. Both start at the same instant. The race is biased toward
//! the signal, and when the deadline fires one last non-blocking check is
//! made, so a signal that lands on the deadline still counts as completion.
//! Whatever loses is cancelled, and the armed channel is always closed before
//! the outcome is returned. Cancelling the outer token ends the wait as
//! [`WaitOutcome::Cancelled`], with the same last check for a signal.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::EventSender;
use crate::signal::{ArmedChannel, Delivery, SignalChannel};

/// How the wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A signal arrived before the deadline.
    Completed(Delivery),
    /// The deadline fired first.
    TimedOut,
    /// The outer token was cancelled first.
    Cancelled,
}

/// Races a signal channel against a timeout.
#[derive(Debug, Clone, Copy)]
pub struct WaitEngine {
    timeout: Duration,
}

impl WaitEngine {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arms `channel` and waits for the first signal or the deadline.
    ///
    /// A zero timeout resolves to [`WaitOutcome::TimedOut`] without arming
    /// anything. Cancelling `cancel` from outside ends the wait as
    /// [`WaitOutcome::Cancelled`].
    pub async fn race(
        &self,
        channel: &SignalChannel,
        cancel: &CancellationToken,
        events: Option<EventSender>,
    ) -> WaitOutcome {
        if self.timeout.is_zero() {
            info!("zero timeout; not waiting for a signal");
            return WaitOutcome::TimedOut;
        }
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if channel.is_empty() {
            warn!("no signal sources configured; the run can only time out");
        }

        let mut armed = channel.arm(cancel.child_token(), events);
        let outcome = self.race_armed(&mut armed, cancel).await;
        armed.close().await;
        outcome
    }

    async fn race_armed(&self, armed: &mut ArmedChannel, cancel: &CancellationToken) -> WaitOutcome {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut exhausted = false;

        let ended = loop {
            let ended = tokio::select! {
                biased;
                delivery = armed.recv(), if !exhausted => match delivery {
                    Some(delivery) => return WaitOutcome::Completed(delivery),
                    None => {
                        debug!("all signal sources exhausted; waiting out the deadline");
                        exhausted = true;
                        None
                    }
                },
                _ = &mut deadline => Some(WaitOutcome::TimedOut),
                _ = cancel.cancelled() => Some(WaitOutcome::Cancelled),
            };
            if let Some(ended) = ended {
                break ended;
            }
        };

        // Same-instant tie goes to the signal: let sources woken with the
        // deadline run before the final check.
        tokio::task::yield_now().await;
        match armed.try_recv() {
            Some(delivery) => WaitOutcome::Completed(delivery),
            None if ended == WaitOutcome::Cancelled => {
                info!("wait cancelled before a completion signal");
                ended
            }
            None => {
                info!(timeout = ?self.timeout, "timed out waiting for completion signal");
                ended
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{CompletionSignal, SignalError, SignalSink, SignalSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct After {
        delay: Duration,
        armed: AtomicBool,
    }

    impl After {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                armed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl SignalSource for After {
        fn name(&self) -> &'static str {
            "after"
        }

        async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError> {
            self.armed.store(true, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.delay) => {
                    sink.emit(self.name(), CompletionSignal::ForegroundTransition);
                }
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn signal_before_deadline_completes() {
        let channel = SignalChannel::new().with_source(After::new(Duration::from_secs(10)));
        let outcome = WaitEngine::new(Duration::from_secs(60))
            .race(&channel, &CancellationToken::new(), None)
            .await;
        assert!(matches!(outcome, WaitOutcome::Completed(ref d) if d.source == "after"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_before_signal_times_out() {
        let channel = SignalChannel::new().with_source(After::new(Duration::from_secs(120)));
        let start = tokio::time::Instant::now();
        let outcome = WaitEngine::new(Duration::from_secs(60))
            .race(&channel, &CancellationToken::new(), None)
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_never_arms() {
        let source = After::new(Duration::ZERO);
        let channel = SignalChannel::new().with_source(source.clone());
        let outcome = WaitEngine::new(Duration::ZERO)
            .race(&channel, &CancellationToken::new(), None)
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(!source.armed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_signal_counts_as_completed() {
        let channel = SignalChannel::new().with_source(After::new(Duration::from_secs(5)));
        let outcome = WaitEngine::new(Duration::from_secs(5))
            .race(&channel, &CancellationToken::new(), None)
            .await;
        assert!(matches!(outcome, WaitOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_sources_wait_out_the_deadline() {
        let channel = SignalChannel::new();
        let start = tokio::time::Instant::now();
        let outcome = WaitEngine::new(Duration::from_secs(30))
            .race(&channel, &CancellationToken::new(), None)
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn outer_cancellation_ends_the_wait() {
        let channel = SignalChannel::new().with_source(After::new(Duration::from_secs(3600)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let start = tokio::time::Instant::now();
        let outcome = WaitEngine::new(Duration::from_secs(600))
            .race(&channel, &cancel, None)
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_never_arms() {
        let source = After::new(Duration::ZERO);
        let channel = SignalChannel::new().with_source(source.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = WaitEngine::new(Duration::from_secs(10))
            .race(&channel, &cancel, None)
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(!source.armed.load(Ordering::SeqCst));
    }
}
