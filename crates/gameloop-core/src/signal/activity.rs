//! Completion as the return of a launch-for-result call.
//!
//! Some launch paths hold a child process that only exits once the game loop
//! has returned a result: `adb shell am instrument -w` for the Android
//! harness, or the target itself for host processes. Its exit is the signal.
//!
//! When the child's stdout is piped, it is read to the end alongside the wait
//! and kept for [`ActivityResultSource::output`]; the orchestrator judges the
//! result from the exit code and that output.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CompletionSignal, SignalError, SignalSink, SignalSource};

/// Waits on a launch-for-result child process.
///
/// The child can only be awaited once; a second `detect` call returns
/// immediately without emitting.
pub struct ActivityResultSource {
    child: Mutex<Option<Child>>,
    output: Mutex<Option<String>>,
}

impl ActivityResultSource {
    pub fn new(child: Child) -> Self {
        Self {
            child: Mutex::new(Some(child)),
            output: Mutex::new(None),
        }
    }

    /// What the child printed before exiting, if its stdout was captured.
    pub fn output(&self) -> Option<String> {
        lock(&self.output).clone()
    }

    fn take(&self) -> Option<Child> {
        lock(&self.child).take()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SignalSource for ActivityResultSource {
    fn name(&self) -> &'static str {
        "activity_result"
    }

    async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError> {
        let Some(mut child) = self.take() else {
            debug!("result child already consumed");
            return Ok(());
        };

        let stdout = child.stdout.take();
        let captured = stdout.is_some();
        let read_output = async move {
            let mut bytes = Vec::new();
            if let Some(mut stdout) = stdout {
                if let Err(e) = stdout.read_to_end(&mut bytes).await {
                    debug!(error = %e, "result output truncated");
                }
            }
            String::from_utf8_lossy(&bytes).into_owned()
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Ok(())
            }
            (status, output) = async { tokio::join!(child.wait(), read_output) } => {
                let code = status?.code().unwrap_or(-1);
                info!(code, "launch-for-result returned");
                if captured {
                    *lock(&self.output) = Some(output);
                }
                sink.emit(self.name(), CompletionSignal::ActivityResult { code });
                Ok(())
            }
        }
    }
}
