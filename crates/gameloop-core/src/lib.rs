//! # gameloop-core
//!
//! Core library for unattended game loop test runs.
//!
//! A game loop run launches a separate application with a scenario id, then
//! has to find out, without any return value from that app, when the
//! scenario finished. This crate provides the pieces of such a run: target
//! launchers, completion signal detectors, a bounded wait, a dialog
//! suppressor for system prompts, and post-run diagnostics.
//!
//! ## Modules
//!
//! - [`config`] - Run configuration, launch constants and persisted settings
//! - [`orchestrator`] - The run driver that composes everything below
//! - [`session`] - Launch session state machine with event broadcasting
//! - [`signal`] - Completion signal sources and the single-resolution channel
//! - [`wait`] - Race between the completion signal and the timeout
//! - [`suppressor`] - Periodic dismissal of system permission dialogs
//! - [`diagnostics`] - Sentinel file and pasteboard collection
//! - [`validation`] - Test runner summaries parsed from game loop output
//! - [`launcher`] - Simulator, Android and host-process launchers
//! - [`periodic`] - Cancellable periodic tasks
//! - [`simctl`] - Wrapper around Apple's `xcrun simctl` CLI
//! - [`adb`] - Wrapper around the Android Debug Bridge
//! - [`axe`] - Wrapper around the `axe` accessibility tool
//! - [`element`] - Accessibility element types
//!
//! ## External Dependencies
//!
//! Depending on the platform, the following tools are used:
//!
//! - **Xcode** (for `xcrun simctl`) - simulator launches and pasteboard
//! - **axe** - dialog dismissal on simulators (`brew install cameroncooke/axe/axe`)
//! - **adb** - Android devices and emulators
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gameloop_core::config::{ScenarioConfig, TimeoutLane};
//! use gameloop_core::launcher::SimctlLauncher;
//! use gameloop_core::orchestrator::Orchestrator;
//! use gameloop_core::signal::callback::{fresh_session_name, UrlCallbackSource};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ScenarioConfig::from_env(TimeoutLane::Ci).unwrap();
//!     let session = fresh_session_name();
//!     let orchestrator = Orchestrator::new(Arc::new(SimctlLauncher::default()))
//!         .with_signal_source(Arc::new(UrlCallbackSource::for_session(&config, &session)));
//!
//!     let cancel = CancellationToken::new();
//!     let result = orchestrator.run(&config, &cancel).await;
//!     if let Some(reason) = result.failure_reason() {
//!         eprintln!("{}", reason);
//!     }
//! }
//! ```

pub mod adb;
pub mod axe;
pub mod config;
pub mod diagnostics;
pub mod element;
pub mod launcher;
pub mod orchestrator;
pub mod periodic;
pub mod session;
pub mod signal;
pub mod simctl;
pub mod suppressor;
pub mod validation;
pub mod wait;
