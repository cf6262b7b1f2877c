//! Cancellable periodic tasks.
//!
//! The dialog suppressor and the foreground poller both run a body at a fixed
//! interval for as long as a session is awaiting its signal. [`PeriodicTask`]
//! owns that loop: it sleeps, runs one tick, backs off on consecutive
//! failures, and exits as soon as its [`CancellationToken`] fires or a tick
//! asks it to stop.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use gameloop_core::periodic::{PeriodicTask, TickOutcome};
//!
//! #[tokio::main]
//! async fn main() {
//!     let token = CancellationToken::new();
//!     let mut handle = PeriodicTask::spawn("heartbeat", Duration::from_secs(1), token, || async {
//!         println!("tick");
//!         TickOutcome::Continue
//!     });
//!
//!     handle.stop().await;
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

/// Longest sleep between ticks while backing off.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Tick succeeded; keep the base interval.
    Continue,
    /// Tick failed; the next sleep backs off.
    Failed,
    /// The task is done and should exit.
    Stop,
}

/// Handle for controlling a running periodic task.
///
/// Dropping the handle cancels the task.
pub struct TaskHandle {
    name: &'static str,
    cancel_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Cancels the task and waits for it to finish. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel_token.cancel();
        self.join().await;
    }

    /// Waits for the task to exit on its own.
    pub async fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if let Err(e) = handle.await {
                debug!(task = self.name, error = %e, "periodic task ended abnormally");
            }
        }
    }

    /// Cancels the task without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Returns whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawner for interval-driven background loops.
pub struct PeriodicTask;

impl PeriodicTask {
    /// Spawns `tick` every `interval` until `cancel_token` fires or a tick
    /// returns [`TickOutcome::Stop`].
    ///
    /// The first tick runs after one interval has elapsed.
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        cancel_token: CancellationToken,
        tick: F,
    ) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        let token = cancel_token.clone();
        let span = debug_span!("periodic", task = name);
        let join_handle = tokio::spawn(
            async move {
                Self::run_loop(interval, token, tick).await;
            }
            .instrument(span),
        );

        TaskHandle {
            name,
            cancel_token,
            join_handle: Some(join_handle),
        }
    }

    async fn run_loop<F, Fut>(base_interval: Duration, cancel_token: CancellationToken, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TickOutcome>,
    {
        let mut consecutive_errors: u32 = 0;

        loop {
            let sleep_duration = Self::backoff_interval(base_interval, consecutive_errors);

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(sleep_duration) => {}
            }

            // A cancellation that raced the sleep wins over the tick.
            if cancel_token.is_cancelled() {
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                outcome = tick() => outcome,
            };

            let prev_errors = consecutive_errors;
            match outcome {
                TickOutcome::Stop => break,
                TickOutcome::Continue => consecutive_errors = 0,
                TickOutcome::Failed => consecutive_errors = consecutive_errors.saturating_add(1),
            }
            if prev_errors == 0 && consecutive_errors > 0 {
                debug!(consecutive_errors, "entering backoff");
            } else if prev_errors > 0 && consecutive_errors == 0 {
                debug!("recovered from backoff");
            }
        }
    }

    /// Computes the backoff interval given the base interval and consecutive error count.
    /// Doubles with each error, capped at 30 seconds.
    fn backoff_interval(base: Duration, consecutive_errors: u32) -> Duration {
        let multiplier = 1u32.checked_shl(consecutive_errors).unwrap_or(u32::MAX);
        let backoff = base.saturating_mul(multiplier);
        std::cmp::min(backoff, MAX_BACKOFF.max(base))
    }
}
