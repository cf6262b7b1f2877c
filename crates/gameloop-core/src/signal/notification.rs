//! Completion through a named inter-process notification.
//!
//! The target posts a Darwin notification when it finishes. The source runs a
//! watcher command that blocks until the notification is delivered, so the
//! watcher's successful exit is the signal. On simulators the watcher is
//! `xcrun simctl spawn <udid> notifyutil -1 <name>`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CompletionSignal, SignalError, SignalSink, SignalSource};

/// Waits for a named notification through a blocking watcher command.
#[derive(Debug, Clone)]
pub struct NotificationSource {
    name: String,
    program: String,
    args: Vec<String>,
}

impl NotificationSource {
    /// Watches `name` inside the given simulator.
    pub fn simctl(udid: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        let args = vec![
            "simctl".to_string(),
            "spawn".to_string(),
            udid.to_string(),
            "notifyutil".to_string(),
            "-1".to_string(),
            name.clone(),
        ];
        Self {
            name,
            program: "xcrun".to_string(),
            args,
        }
    }

    /// Watches `name` with an arbitrary command that exits once it is posted.
    pub fn command(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    /// Notification name.
    pub fn notification_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl SignalSource for NotificationSource {
    fn name(&self) -> &'static str {
        "process_notification"
    }

    async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        debug!(notification = %self.name, program = %self.program, "notification watcher started");

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Ok(())
            }
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    info!(notification = %self.name, "notification delivered");
                    sink.emit(self.name(), CompletionSignal::ProcessNotification {
                        name: self.name.clone(),
                    });
                    Ok(())
                } else {
                    Err(SignalError::WatcherFailed(format!(
                        "{} exited with {}",
                        self.program, status
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalChannel;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn simctl_watcher_arguments() {
        let source = NotificationSource::simctl("UDID-1", "com.example.done");
        assert_eq!(source.program, "xcrun");
        assert_eq!(
            source.args,
            vec!["simctl", "spawn", "UDID-1", "notifyutil", "-1", "com.example.done"]
        );
        assert_eq!(source.notification_name(), "com.example.done");
    }

    #[tokio::test]
    async fn successful_watcher_exit_is_delivery() {
        let source = NotificationSource::command("done", "true", vec![]);
        let mut armed = SignalChannel::new()
            .with_source(Arc::new(source))
            .arm(CancellationToken::new(), None);

        let delivery = armed.recv().await.unwrap();
        assert_eq!(delivery.source, "process_notification");
        assert_eq!(
            delivery.signal,
            CompletionSignal::ProcessNotification { name: "done".into() }
        );
        armed.close().await;
    }

    #[tokio::test]
    async fn failed_watcher_does_not_resolve() {
        let source = NotificationSource::command("done", "false", vec![]);
        let mut armed = SignalChannel::new()
            .with_source(Arc::new(source))
            .arm(CancellationToken::new(), None);
        assert!(armed.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_kills_watcher() {
        let source = NotificationSource::command("never", "sleep", vec!["30".into()]);
        let token = CancellationToken::new();
        let mut armed = SignalChannel::new()
            .with_source(Arc::new(source))
            .arm(token.clone(), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        armed.close().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(armed.try_recv().is_none());
    }
}
