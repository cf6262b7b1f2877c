//! Dismissal of system permission dialogs during unattended runs.
//!
//! Launching a game loop can raise OS prompts ("Open in ...?", notification
//! and tracking permissions) that would stall a headless run. The
//! [`DialogSuppressor`] scans a [`DialogSurface`] on a fixed interval and
//! activates the first button whose label is exactly one of an allow-list.
//!
//! The surface only ever reports buttons of the system-owned alert layer, so
//! the target application's own buttons are never touched. Failures are
//! logged and retried on the next tick; they never fail the run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::element::UIElement;
use crate::periodic::{PeriodicTask, TaskHandle, TickOutcome};
use crate::session::{EventSender, SessionEvent};

/// Errors from scanning or activating dialog buttons.
#[derive(Error, Debug)]
pub enum SuppressorError {
    /// The surface could not be read.
    #[error("Surface scan failed: {0}")]
    Scan(String),

    /// A button could not be activated.
    #[error("Activation failed: {0}")]
    Activate(String),
}

/// A system-owned surface that may show permission dialogs.
#[async_trait]
pub trait DialogSurface: Send + Sync {
    /// Returns the candidate buttons currently shown by system dialogs.
    async fn scan(&self) -> Result<Vec<UIElement>, SuppressorError>;

    /// Activates (taps) a button returned by [`DialogSurface::scan`].
    async fn activate(&self, element: &UIElement) -> Result<(), SuppressorError>;
}

/// Returns the first button whose label exactly equals an allow-listed label.
///
/// Matching is case-sensitive and ignores buttons without a label.
pub fn find_dismiss_target<'a>(buttons: &'a [UIElement], labels: &[String]) -> Option<&'a UIElement> {
    buttons.iter().find(|button| {
        button
            .label
            .as_deref()
            .map_or(false, |label| labels.iter().any(|allowed| allowed == label))
    })
}

/// Handle for a running suppressor.
pub struct SuppressorHandle {
    task: TaskHandle,
    dismissed: Arc<AtomicUsize>,
}

impl SuppressorHandle {
    /// Stops scanning and waits for the current tick to finish. Idempotent.
    pub async fn stop(&mut self) {
        self.task.stop().await;
    }

    /// Number of buttons activated so far.
    pub fn dismissed_count(&self) -> usize {
        self.dismissed.load(Ordering::SeqCst)
    }

    /// Whether the suppressor is still scanning.
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

/// Periodic dialog dismissal.
pub struct DialogSuppressor;

impl DialogSuppressor {
    /// Starts scanning `surface` every `interval` until `cancel` fires or the
    /// handle is stopped.
    pub fn spawn(
        surface: Arc<dyn DialogSurface>,
        labels: Vec<String>,
        interval: Duration,
        cancel: CancellationToken,
        events: Option<EventSender>,
    ) -> SuppressorHandle {
        let dismissed = Arc::new(AtomicUsize::new(0));
        let counter = dismissed.clone();
        let labels = Arc::new(labels);

        let task = PeriodicTask::spawn("dialog_suppressor", interval, cancel, move || {
            let surface = surface.clone();
            let labels = labels.clone();
            let counter = counter.clone();
            let events = events.clone();
            async move { Self::tick(surface.as_ref(), &labels, &counter, events.as_ref()).await }
        });

        SuppressorHandle { task, dismissed }
    }

    async fn tick(
        surface: &dyn DialogSurface,
        labels: &[String],
        counter: &AtomicUsize,
        events: Option<&EventSender>,
    ) -> TickOutcome {
        let buttons = match surface.scan().await {
            Ok(buttons) => buttons,
            Err(e) => {
                debug!(error = %e, "dialog scan failed");
                return TickOutcome::Failed;
            }
        };

        let Some(target) = find_dismiss_target(&buttons, labels) else {
            return TickOutcome::Continue;
        };
        let label = target.label.clone().unwrap_or_default();

        match surface.activate(target).await {
            Ok(()) => {
                counter.fetch_add(1, Ordering::SeqCst);
                info!(%label, "dismissed system dialog");
                if let Some(events) = events {
                    let _ = events.send(SessionEvent::DialogDismissed { label });
                }
                TickOutcome::Continue
            }
            Err(e) => {
                debug!(%label, error = %e, "dialog activation failed");
                TickOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn button(label: &str) -> UIElement {
        UIElement {
            label: Some(label.to_string()),
            element_type: Some("Button".to_string()),
            ..Default::default()
        }
    }

    fn default_labels() -> Vec<String> {
        vec!["Open".into(), "Allow".into(), "OK".into()]
    }

    #[test]
    fn exact_label_match_only() {
        let buttons = vec![button("Don't Allow"), button("Allow While Using App"), button("Allow")];
        let target = find_dismiss_target(&buttons, &default_labels()).unwrap();
        assert_eq!(target.label.as_deref(), Some("Allow"));

        let buttons = vec![button("ok"), button("Cancel")];
        assert!(find_dismiss_target(&buttons, &default_labels()).is_none());
    }

    #[test]
    fn first_matching_button_wins() {
        let buttons = vec![button("Cancel"), button("OK"), button("Open")];
        let target = find_dismiss_target(&buttons, &default_labels()).unwrap();
        assert_eq!(target.label.as_deref(), Some("OK"));
    }

    #[test]
    fn unlabeled_buttons_are_ignored() {
        let buttons = vec![UIElement::default()];
        assert!(find_dismiss_target(&buttons, &default_labels()).is_none());
    }

    struct OneDialog {
        shown: Mutex<Vec<UIElement>>,
        activated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DialogSurface for OneDialog {
        async fn scan(&self) -> Result<Vec<UIElement>, SuppressorError> {
            Ok(self.shown.lock().unwrap().clone())
        }

        async fn activate(&self, element: &UIElement) -> Result<(), SuppressorError> {
            self.activated
                .lock()
                .unwrap()
                .push(element.label.clone().unwrap_or_default());
            self.shown.lock().unwrap().clear();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dismisses_dialog_once() {
        let surface = Arc::new(OneDialog {
            shown: Mutex::new(vec![button("Cancel"), button("Open")]),
            activated: Mutex::new(Vec::new()),
        });
        let (events, mut events_rx) = tokio::sync::broadcast::channel(8);
        let mut handle = DialogSuppressor::spawn(
            surface.clone(),
            default_labels(),
            Duration::from_secs(2),
            CancellationToken::new(),
            Some(events),
        );

        tokio::time::sleep(Duration::from_secs(7)).await;
        handle.stop().await;
        handle.stop().await;

        assert_eq!(handle.dismissed_count(), 1);
        assert_eq!(*surface.activated.lock().unwrap(), vec!["Open".to_string()]);
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            SessionEvent::DialogDismissed { ref label } if label == "Open"
        ));
        assert!(!handle.is_running());
    }

    struct Broken;

    #[async_trait]
    impl DialogSurface for Broken {
        async fn scan(&self) -> Result<Vec<UIElement>, SuppressorError> {
            Err(SuppressorError::Scan("no accessibility".into()))
        }

        async fn activate(&self, _element: &UIElement) -> Result<(), SuppressorError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scan_errors_are_not_fatal() {
        let mut handle = DialogSuppressor::spawn(
            Arc::new(Broken),
            default_labels(),
            Duration::from_millis(100),
            CancellationToken::new(),
            None,
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.is_running());
        handle.stop().await;
        assert_eq!(handle.dismissed_count(), 0);
    }
}
