//! Completion through a callback URL.
//!
//! When a target finishes its scenario it invokes the completion URL
//! `<completion_scheme>://?scenario=<id>`. The orchestrator listens for that URL
//! on a Unix socket; the target (simulator apps can reach host sockets), a
//! URL-scheme handler, or `gameloop signal` forwards it there.
//!
//! # Protocol
//!
//! Line-based JSON, one message per line:
//! - client sends a [`CallbackRequest`]; a bare URL line is accepted as
//!   [`CallbackRequest::Complete`]
//! - server answers with one [`CallbackReply`]
//!
//! Sockets live in `~/.gameloop/` as `gameloop_{session_name}.sock`. Each run
//! gets its own name (see [`fresh_session_name`]). The listener is bound in
//! [`SignalSource::prepare`], before the target is launched, so a URL sent
//! while the launch is still in progress waits in the socket backlog. A socket
//! file that still answers belongs to another run and is left alone.
//!
//! # Example
//!
//! ```no_run
//! use gameloop_core::signal::callback::{post_callback, socket_path};
//!
//! #[tokio::main]
//! async fn main() {
//!     let reply = post_callback(&socket_path("nightly"), "gameloop-complete://?scenario=5")
//!         .await
//!         .unwrap();
//!     println!("{:?}", reply);
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CompletionSignal, SignalError, SignalSink, SignalSource};
use crate::config::{gameloop_dir, ScenarioConfig};

/// Returns the callback socket path for a session.
pub fn socket_path(session_name: &str) -> PathBuf {
    gameloop_dir().join(format!("gameloop_{}.sock", session_name))
}

/// A session name no other run uses.
pub fn fresh_session_name() -> String {
    format!("run-{}", Uuid::new_v4().simple())
}

/// Binds `path`, replacing a stale socket file but never a live listener.
async fn bind_listener(path: &Path) -> Result<UnixListener, SignalError> {
    if std::fs::symlink_metadata(path).is_ok() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(SignalError::SocketInUse(path.to_path_buf()));
        }
        // Remove a stale socket (ignore NotFound errors as socket may not exist)
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove existing callback socket");
            }
        }
    }

    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "callback listener ready");
    Ok(listener)
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, "failed to clean up callback socket");
        }
    }
}

/// A parsed `<scheme>://?key=value` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrl {
    /// URL scheme, lowercased.
    pub scheme: String,
    /// Decoded query parameters.
    pub params: BTreeMap<String, String>,
}

impl CallbackUrl {
    /// The `scenario` parameter as an integer.
    pub fn scenario(&self) -> Option<i64> {
        self.params.get("scenario").and_then(|s| s.trim().parse().ok())
    }
}

/// Parses a callback URL of the form `<scheme>://[host][/path]?k=v&k2=v2`.
///
/// Only the scheme and query are kept; keys and values are percent-decoded
/// and `+` is read as a space.
pub fn parse_callback_url(raw: &str) -> Result<CallbackUrl, SignalError> {
    let raw = raw.trim();
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| SignalError::InvalidUrl(format!("missing '://' in '{}'", raw)))?;

    let valid_scheme = scheme
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid_scheme {
        return Err(SignalError::InvalidUrl(format!("bad scheme '{}'", scheme)));
    }

    let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");
    let query = query.split('#').next().unwrap_or("");

    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(key)?, percent_decode(value)?);
    }

    Ok(CallbackUrl {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}

fn percent_decode(raw: &str) -> Result<String, SignalError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = raw
                    .get(i + 1..i + 3)
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| SignalError::InvalidUrl(format!("bad escape in '{}'", raw)))?;
                out.push(hex);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| SignalError::InvalidUrl(format!("non UTF-8 value '{}'", raw)))
}

/// A request sent to the callback listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CallbackRequest {
    /// Report completion with the given URL.
    Complete {
        /// The completion URL.
        url: String,
    },
    /// Liveness check.
    Ping,
}

/// The listener's answer to a [`CallbackRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CallbackReply {
    /// The URL completed the session.
    Ack,
    /// The URL was valid but the session had already been resolved.
    AlreadyResolved,
    /// The URL was rejected.
    Rejected {
        /// Why the URL was rejected.
        message: String,
    },
    /// Answer to [`CallbackRequest::Ping`].
    Pong,
}

/// Sends one request to a callback listener and returns its reply.
pub async fn send_request(socket: &Path, request: &CallbackRequest) -> Result<CallbackReply, SignalError> {
    let stream = UnixStream::connect(socket).await?;
    let (reader, mut writer) = stream.into_split();
    let json = serde_json::to_string(request)? + "\n";
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    Ok(serde_json::from_str(line.trim())?)
}

/// Posts a completion URL to a callback listener.
pub async fn post_callback(socket: &Path, url: &str) -> Result<CallbackReply, SignalError> {
    send_request(socket, &CallbackRequest::Complete { url: url.to_string() }).await
}

/// Expected scheme and scenario of a completion URL.
#[derive(Debug, Clone)]
struct CallbackMatcher {
    completion_scheme: String,
    scenario_id: i64,
}

impl CallbackMatcher {
    fn check(&self, raw: &str) -> Result<(), String> {
        let url = parse_callback_url(raw).map_err(|e| e.to_string())?;
        if url.scheme != self.completion_scheme {
            return Err(format!(
                "expected scheme '{}', got '{}'",
                self.completion_scheme, url.scheme
            ));
        }
        match url.scenario() {
            Some(id) if id == self.scenario_id => Ok(()),
            Some(id) => Err(format!(
                "scenario {} does not match running scenario {}",
                id, self.scenario_id
            )),
            None => Err("missing scenario parameter".to_string()),
        }
    }
}

fn parse_request(line: &str) -> Result<CallbackRequest, SignalError> {
    if line.starts_with('{') {
        Ok(serde_json::from_str(line)?)
    } else {
        Ok(CallbackRequest::Complete { url: line.to_string() })
    }
}

/// Serves one client. Returns `true` if it resolved the channel.
async fn handle_client(
    stream: UnixStream,
    matcher: CallbackMatcher,
    sink: SignalSink,
) -> Result<bool, SignalError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(false);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (reply, resolved) = match parse_request(trimmed) {
            Ok(CallbackRequest::Ping) => (CallbackReply::Pong, false),
            Ok(CallbackRequest::Complete { url }) => match matcher.check(&url) {
                Ok(()) => {
                    if sink.emit("url_callback", CompletionSignal::UrlCallback { payload: url }) {
                        (CallbackReply::Ack, true)
                    } else {
                        (CallbackReply::AlreadyResolved, false)
                    }
                }
                Err(message) => {
                    debug!(%message, "callback rejected");
                    (CallbackReply::Rejected { message }, false)
                }
            },
            Err(e) => (CallbackReply::Rejected { message: e.to_string() }, false),
        };

        let json = serde_json::to_string(&reply)? + "\n";
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
        if resolved {
            return Ok(true);
        }
    }
}

/// Listens on a Unix socket for the completion URL of one scenario.
pub struct UrlCallbackSource {
    socket_path: PathBuf,
    matcher: CallbackMatcher,
    prepared: Mutex<Option<UnixListener>>,
}

impl UrlCallbackSource {
    /// Creates a listener bound to an explicit socket path.
    pub fn new(socket_path: impl Into<PathBuf>, completion_scheme: impl Into<String>, scenario_id: i64) -> Self {
        Self {
            socket_path: socket_path.into(),
            matcher: CallbackMatcher {
                completion_scheme: completion_scheme.into().to_ascii_lowercase(),
                scenario_id,
            },
            prepared: Mutex::new(None),
        }
    }

    /// Creates a listener for `config` on the named session's socket.
    pub fn for_session(config: &ScenarioConfig, session_name: &str) -> Self {
        Self::new(
            socket_path(session_name),
            config.constants().completion_scheme.clone(),
            config.scenario_id(),
        )
    }

    /// Socket this source listens on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether a listener is bound and waiting to be armed.
    pub fn is_prepared(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<UnixListener>> {
        self.prepared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SignalSource for UrlCallbackSource {
    fn name(&self) -> &'static str {
        "url_callback"
    }

    async fn prepare(&self) -> Result<(), SignalError> {
        if self.is_prepared() {
            return Ok(());
        }
        let listener = bind_listener(&self.socket_path).await?;
        *self.lock() = Some(listener);
        Ok(())
    }

    async fn release(&self) {
        let listener = self.lock().take();
        if let Some(listener) = listener {
            drop(listener);
            remove_socket(&self.socket_path);
            debug!(path = %self.socket_path.display(), "callback listener released");
        }
    }

    async fn detect(&self, sink: SignalSink, cancel: CancellationToken) -> Result<(), SignalError> {
        let prepared = self.lock().take();
        let listener = match prepared {
            Some(listener) => listener,
            None => bind_listener(&self.socket_path).await?,
        };

        let mut clients: JoinSet<Result<bool, SignalError>> = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            debug!("callback client connected");
                            clients.spawn(handle_client(stream, self.matcher.clone(), sink.clone()));
                        }
                        Err(e) => break Err(SignalError::Io(e)),
                    }
                }
                Some(joined) = clients.join_next(), if !clients.is_empty() => {
                    match joined {
                        Ok(Ok(true)) => break Ok(()),
                        Ok(Ok(false)) => {}
                        Ok(Err(e)) => debug!(error = %e, "callback client error"),
                        Err(e) => debug!(error = %e, "callback client task failed"),
                    }
                }
            }
        };

        clients.abort_all();
        drop(listener);
        remove_socket(&self.socket_path);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_and_scenario() {
        let url = parse_callback_url("gameloop-complete://?scenario=5").unwrap();
        assert_eq!(url.scheme, "gameloop-complete");
        assert_eq!(url.scenario(), Some(5));
    }

    #[test]
    fn parses_host_path_and_fragment() {
        let url = parse_callback_url("GameLoop://run/now?scenario=2&note=hello+world%21#frag").unwrap();
        assert_eq!(url.scheme, "gameloop");
        assert_eq!(url.scenario(), Some(2));
        assert_eq!(url.params.get("note").map(String::as_str), Some("hello world!"));
    }

    #[test]
    fn url_without_query_has_no_scenario() {
        let url = parse_callback_url("gameloop-complete://").unwrap();
        assert!(url.params.is_empty());
        assert_eq!(url.scenario(), None);
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse_callback_url("no-scheme-here").is_err());
        assert!(parse_callback_url("1abc://?scenario=1").is_err());
        assert!(parse_callback_url("ok://?scenario=%zz").is_err());
        assert!(parse_callback_url("ok://?scenario=%4").is_err());
    }

    #[test]
    fn validate_checks_scheme_and_scenario() {
        let source = UrlCallbackSource::new("/tmp/unused.sock", "gameloop-complete", 5);
        let matcher = &source.matcher;
        assert!(matcher.check("gameloop-complete://?scenario=5").is_ok());
        assert!(matcher.check("gameloop://?scenario=5").is_err());
        assert!(matcher.check("gameloop-complete://?scenario=6").is_err());
        assert!(matcher.check("gameloop-complete://").is_err());
    }

    #[test]
    fn bare_url_line_is_a_complete_request() {
        match parse_request("gameloop-complete://?scenario=1").unwrap() {
            CallbackRequest::Complete { url } => assert_eq!(url, "gameloop-complete://?scenario=1"),
            other => panic!("unexpected request: {:?}", other),
        }
        assert!(matches!(
            parse_request(r#"{"type":"Ping"}"#).unwrap(),
            CallbackRequest::Ping
        ));
    }

    #[test]
    fn fresh_session_names_differ() {
        let a = fresh_session_name();
        let b = fresh_session_name();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn release_removes_prepared_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prepared.sock");
        let source = UrlCallbackSource::new(&path, "gameloop-complete", 1);

        source.prepare().await.unwrap();
        assert!(source.is_prepared());
        assert!(path.exists());

        source.release().await;
        assert!(!source.is_prepared());
        assert!(!path.exists());
    }

    #[test]
    fn reply_json_shape() {
        let json = serde_json::to_string(&CallbackReply::Rejected { message: "nope".into() }).unwrap();
        assert_eq!(json, r#"{"type":"Rejected","message":"nope"}"#);
    }
}
