//! Completion observed as the harness returning to the foreground.
//!
//! When a game loop ends, the target app exits or is backgrounded and the
//! launcher (harness) becomes active again. That alone is ambiguous: a crash
//! or a stray dialog looks the same. [`ForegroundSource`] therefore emits
//! only when the harness is in the foreground *and* the probe confirms the
//! scenario finished.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CompletionSignal, SignalError, SignalSink, SignalSource};
use crate::axe::Axe;
use crate::periodic::{PeriodicTask, TickOutcome};
use crate::simctl::Simctl;

/// Answers the two questions the foreground source polls.
#[async_trait]
pub trait ForegroundProbe: Send + Sync {
    /// Whether the harness is in the foreground (the target no longer is).
    async fn harness_in_foreground(&self) -> Result<bool, SignalError>;

    /// Whether an independent signal confirms the scenario completed.
    async fn completion_confirmed(&self) -> Result<bool, SignalError>;
}

/// Polls a [`ForegroundProbe`] at a fixed interval.
pub struct ForegroundSource {
    probe: Arc<dyn ForegroundProbe>,
    interval: Duration,
}

impl ForegroundSource {
    pub fn new(probe: Arc<dyn ForegroundProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }

    async fn check(probe: &dyn ForegroundProbe) -> Result<bool, SignalError> {
        Ok(probe.harness_in_foreground().await? && probe.completion_confirmed().await?)
    }
}

#[async_trait]
impl SignalSource for ForegroundSource {
    fn name(&self) -> &'static str {
        "foreground"
    }

    async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError> {
        let probe = self.probe.clone();
        let name = self.name();
        let mut handle = PeriodicTask::spawn("foreground_poll", self.interval, cancel.child_token(), move || {
            let probe = probe.clone();
            let sink = sink.clone();
            async move {
                match Self::check(probe.as_ref()).await {
                    Ok(true) => {
                        sink.emit(name, CompletionSignal::ForegroundTransition);
                        TickOutcome::Stop
                    }
                    Ok(false) => TickOutcome::Continue,
                    Err(e) => {
                        debug!(error = %e, "foreground probe failed");
                        TickOutcome::Continue
                    }
                }
            }
        });
        handle.join().await;
        Ok(())
    }
}

/// Foreground probe for a simulator target.
///
/// The target counts as gone once its `UIKitApplication` job disappears from
/// the simulator's `launchctl` listing. Completion is confirmed by the
/// sentinel file in the app's data container, or by the completion marker
/// being visible on screen.
#[derive(Debug, Clone)]
pub struct SimctlForegroundProbe {
    udid: String,
    bundle_id: String,
    results_subdir: String,
    sentinel_name: String,
    marker: String,
}

impl SimctlForegroundProbe {
    pub fn new(
        udid: impl Into<String>,
        bundle_id: impl Into<String>,
        results_subdir: impl Into<String>,
        sentinel_name: impl Into<String>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            udid: udid.into(),
            bundle_id: bundle_id.into(),
            results_subdir: results_subdir.into(),
            sentinel_name: sentinel_name.into(),
            marker: marker.into(),
        }
    }

    fn sentinel_path(&self) -> Result<PathBuf, SignalError> {
        let data = Simctl::app_container(&self.udid, &self.bundle_id, "data")
            .map_err(|e| SignalError::Probe(e.to_string()))?;
        Ok(data.join(&self.results_subdir).join(&self.sentinel_name))
    }
}

#[async_trait]
impl ForegroundProbe for SimctlForegroundProbe {
    async fn harness_in_foreground(&self) -> Result<bool, SignalError> {
        let udid = self.udid.clone();
        let bundle_id = self.bundle_id.clone();
        tokio::task::spawn_blocking(move || {
            let listing = Simctl::launchctl_list(&udid).map_err(|e| SignalError::Probe(e.to_string()))?;
            Ok(!Simctl::is_app_listed(&listing, &bundle_id))
        })
        .await
        .map_err(|e| SignalError::Probe(e.to_string()))?
    }

    async fn completion_confirmed(&self) -> Result<bool, SignalError> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || {
            if probe.sentinel_path().map(|p| p.exists()).unwrap_or(false) {
                return Ok(true);
            }
            let hierarchy = Axe::dump_hierarchy(&probe.udid).map_err(|e| SignalError::Probe(e.to_string()))?;
            Ok(Axe::hierarchy_contains(&hierarchy, &probe.marker))
        })
        .await
        .map_err(|e| SignalError::Probe(e.to_string()))?
    }
}
