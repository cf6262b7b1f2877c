//! Integration tests for the completion URL listener.
//!
//! Each test binds a real Unix socket in a temporary directory and talks to
//! it with the same client the `gameloop signal` command uses.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{MockLauncher, ScriptedSource};
use gameloop_core::config::ScenarioConfig;
use gameloop_core::orchestrator::Orchestrator;
use gameloop_core::signal::callback::{
    post_callback, send_request, CallbackReply, CallbackRequest, UrlCallbackSource,
};
use gameloop_core::signal::{CompletionSignal, SignalChannel, SignalError, SignalSource};

/// Waits until the listener at `socket` answers a ping.
async fn wait_for_listener(socket: &Path) {
    for _ in 0..100 {
        if let Ok(CallbackReply::Pong) = send_request(socket, &CallbackRequest::Ping).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("callback listener at {} never came up", socket.display());
}

// ============================================================================
// Listener
// ============================================================================

#[tokio::test]
async fn matching_url_is_acknowledged_and_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    let channel = SignalChannel::new().with_source(Arc::new(UrlCallbackSource::new(
        &socket,
        "gameloop-complete",
        5,
    )));

    let mut armed = channel.arm(CancellationToken::new(), None);
    wait_for_listener(&socket).await;

    let reply = post_callback(&socket, "gameloop-complete://?scenario=5").await.unwrap();
    assert_eq!(reply, CallbackReply::Ack);

    let delivery = armed.recv().await.unwrap();
    assert_eq!(delivery.source, "url_callback");
    assert_eq!(
        delivery.signal,
        CompletionSignal::UrlCallback {
            payload: "gameloop-complete://?scenario=5".into()
        }
    );

    armed.close().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn wrong_scenario_or_scheme_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    let channel = SignalChannel::new().with_source(Arc::new(UrlCallbackSource::new(
        &socket,
        "gameloop-complete",
        5,
    )));

    let mut armed = channel.arm(CancellationToken::new(), None);
    wait_for_listener(&socket).await;

    for url in [
        "gameloop-complete://?scenario=6",
        "gameloop://?scenario=5",
        "gameloop-complete://",
        "not a url",
    ] {
        let reply = post_callback(&socket, url).await.unwrap();
        assert!(
            matches!(reply, CallbackReply::Rejected { .. }),
            "{} gave {:?}",
            url,
            reply
        );
    }
    assert!(armed.try_recv().is_none());

    // Still listening after rejections.
    let reply = post_callback(&socket, "GAMELOOP-COMPLETE://?scenario=5").await.unwrap();
    assert_eq!(reply, CallbackReply::Ack);
    assert!(armed.recv().await.is_some());
    armed.close().await;
}

#[tokio::test]
async fn url_after_another_source_won_is_already_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    let channel = SignalChannel::new()
        .with_source(ScriptedSource::foreground_after(Duration::ZERO))
        .with_source(Arc::new(UrlCallbackSource::new(&socket, "gameloop-complete", 1)));

    let mut armed = channel.arm(CancellationToken::new(), None);
    wait_for_listener(&socket).await;

    let reply = post_callback(&socket, "gameloop-complete://?scenario=1").await.unwrap();
    assert_eq!(reply, CallbackReply::AlreadyResolved);

    let delivery = armed.recv().await.unwrap();
    assert_eq!(delivery.signal, CompletionSignal::ForegroundTransition);
    armed.close().await;
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    std::fs::write(&socket, b"stale").unwrap();

    let channel = SignalChannel::new().with_source(Arc::new(UrlCallbackSource::new(
        &socket,
        "gameloop-complete",
        1,
    )));
    let mut armed = channel.arm(CancellationToken::new(), None);
    wait_for_listener(&socket).await;
    armed.close().await;
}

#[tokio::test]
async fn live_socket_of_another_run_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    let first = Arc::new(UrlCallbackSource::new(&socket, "gameloop-complete", 1));
    first.prepare().await.unwrap();

    let second = UrlCallbackSource::new(&socket, "gameloop-complete", 2);
    assert!(matches!(second.prepare().await, Err(SignalError::SocketInUse(_))));

    let channel = SignalChannel::new().with_source(first.clone());
    let mut armed = channel.arm(CancellationToken::new(), None);
    let reply = post_callback(&socket, "gameloop-complete://?scenario=1").await.unwrap();
    assert_eq!(reply, CallbackReply::Ack);
    assert!(armed.recv().await.is_some());
    armed.close().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn nothing_listening_is_a_client_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = post_callback(&dir.path().join("missing.sock"), "gameloop-complete://?scenario=1").await;
    assert!(result.is_err());
}

// ============================================================================
// Through the orchestrator
// ============================================================================

#[tokio::test]
async fn external_client_completes_orchestrated_run() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    let config = ScenarioConfig::builder(4).timeout(Duration::from_secs(10)).build();

    let launcher = Arc::new(MockLauncher::new());
    let orchestrator = Orchestrator::new(launcher.clone()).with_signal_source(Arc::new(
        UrlCallbackSource::new(&socket, &config.constants().completion_scheme, 4),
    ));

    let client_socket = socket.clone();
    let completion = config.constants().completion_url(4);
    let client = tokio::spawn(async move {
        wait_for_listener(&client_socket).await;
        post_callback(&client_socket, &completion).await
    });

    let result = orchestrator.run(&config, &CancellationToken::new()).await;
    assert!(result.passed());
    assert_eq!(client.await.unwrap().unwrap(), CallbackReply::Ack);
    assert_eq!(launcher.terminate_count(), 1);
}

#[tokio::test]
async fn callback_posted_during_launch_is_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    let config = ScenarioConfig::builder(4).timeout(Duration::from_secs(10)).build();
    let completion = config.constants().completion_url(4);

    let launcher = Arc::new(MockLauncher::posting_early(&socket, completion.clone()));
    let orchestrator = Orchestrator::new(launcher.clone()).with_signal_source(Arc::new(
        UrlCallbackSource::new(&socket, &config.constants().completion_scheme, 4),
    ));

    let result = orchestrator.run(&config, &CancellationToken::new()).await;
    assert!(result.passed(), "{:?}", result.failure_reason());
    assert_eq!(result.signal, Some(CompletionSignal::UrlCallback { payload: completion }));
    assert!(!socket.exists());

    for _ in 0..100 {
        if !launcher.early_replies().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(launcher.early_replies(), vec![CallbackReply::Ack]);
}

#[tokio::test]
async fn failed_launch_releases_the_prepared_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("callback.sock");
    let config = ScenarioConfig::builder(4).timeout(Duration::from_secs(10)).build();

    let orchestrator = Orchestrator::new(Arc::new(MockLauncher::failing())).with_signal_source(
        Arc::new(UrlCallbackSource::new(&socket, &config.constants().completion_scheme, 4)),
    );

    let result = orchestrator.run(&config, &CancellationToken::new()).await;
    assert!(!result.passed());
    assert!(!socket.exists());
}
