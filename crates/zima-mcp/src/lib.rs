//! MCP transports. Every transport is a framing adapter around
//! [`zima_jsonrpc::handle_bytes`]; none of them knows about tools or sessions.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

mod http;
mod sse;
mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::{StdioTransport, run_stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bind and begin serving. Starting a running transport is a no-op.
    async fn start(&mut self) -> Result<()>;

    /// Cancel and wait (bounded) for the serving task to wind down.
    async fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Where clients connect, once started.
    fn endpoint(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub kind: TransportKind,
    pub running: bool,
    pub endpoint: Option<String>,
}

#[derive(Default)]
pub struct TransportManager {
    transports: Vec<Box<dyn Transport>>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, transport: Box<dyn Transport>) {
        self.transports.push(transport);
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Start every transport. One failing to bind does not stop the others.
    pub async fn start_all(&mut self) -> Vec<(TransportKind, Result<()>)> {
        let mut results = Vec::with_capacity(self.transports.len());
        for transport in &mut self.transports {
            let outcome = transport.start().await;
            if let Err(err) = &outcome {
                tracing::error!(transport = %transport.kind(), error = %err, "transport failed to start");
            }
            results.push((transport.kind(), outcome));
        }
        results
    }

    pub async fn stop_all(&mut self) {
        for transport in &mut self.transports {
            transport.stop().await;
        }
    }

    pub fn status(&self) -> Vec<TransportStatus> {
        self.transports
            .iter()
            .map(|t| TransportStatus {
                kind: t.kind(),
                running: t.is_running(),
                endpoint: t.endpoint(),
            })
            .collect()
    }

    pub fn any_running(&self) -> bool {
        self.transports.iter().any(|t| t.is_running())
    }
}

/// Join a listener thread without waiting longer than `limit`.
pub(crate) async fn join_with_timeout(thread: JoinHandle<()>, limit: Duration, what: &str) {
    let joined = tokio::task::spawn_blocking(move || thread.join());
    match tokio::time::timeout(limit, joined).await {
        Ok(Ok(Ok(()))) => {}
        Ok(_) => tracing::warn!(transport = what, "listener thread panicked"),
        Err(_) => tracing::warn!(transport = what, "listener did not stop in time, detaching"),
    }
}

/// Caps the requests a listener serves at once.
pub(crate) struct InFlight {
    active: AtomicUsize,
    limit: usize,
}

impl InFlight {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            limit,
        })
    }

    /// A slot, or `None` when the listener is at its limit. The slot is
    /// released when the permit drops.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Permit(self.clone()))
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

pub(crate) struct Permit(Arc<InFlight>);

impl Drop for Permit {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Strip the query string from a request target.
pub(crate) fn request_path(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

pub(crate) mod cors {
    use tiny_http::{Header, Response};
    use std::io::Cursor;

    fn header(name: &str, value: &str) -> Option<Header> {
        Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
    }

    pub fn respond(status: u16, body: String, content_type: Option<&str>) -> Response<Cursor<Vec<u8>>> {
        let mut response = Response::from_string(body).with_status_code(status);
        let headers = [
            Some(("Access-Control-Allow-Origin", "*")),
            Some(("Access-Control-Allow-Methods", "GET, POST, OPTIONS")),
            Some(("Access-Control-Allow-Headers", "Content-Type, Authorization")),
            content_type.map(|ct| ("Content-Type", ct)),
        ];
        for (name, value) in headers.into_iter().flatten() {
            if let Some(h) = header(name, value) {
                response.add_header(h);
            }
        }
        response
    }

    pub fn json(body: String) -> Response<Cursor<Vec<u8>>> {
        respond(200, body, Some("application/json"))
    }

    pub fn status(code: u16) -> Response<Cursor<Vec<u8>>> {
        respond(code, String::new(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTransport {
        kind: TransportKind,
        fail: bool,
        running: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn start(&mut self) -> Result<()> {
            if self.fail {
                anyhow::bail!("address in use");
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn endpoint(&self) -> Option<String> {
            self.is_running().then(|| format!("fake://{}", self.kind))
        }
    }

    fn fake(kind: TransportKind, fail: bool) -> Box<dyn Transport> {
        Box::new(FakeTransport {
            kind,
            fail,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    #[tokio::test]
    async fn one_failed_start_leaves_the_others_running() {
        let mut manager = TransportManager::new();
        manager.add(fake(TransportKind::Http, true));
        manager.add(fake(TransportKind::Sse, false));

        let results = manager.start_all().await;

        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
        assert!(manager.any_running());
        let status = manager.status();
        assert!(!status[0].running);
        assert_eq!(status[1].endpoint.as_deref(), Some("fake://sse"));

        manager.stop_all().await;
        assert!(!manager.any_running());
    }

    #[test]
    fn in_flight_permits_are_capped_and_released() {
        let limiter = InFlight::new(2);
        let first = limiter.try_acquire().expect("first slot");
        let _second = limiter.try_acquire().expect("second slot");
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.active(), 2);

        drop(first);
        assert!(limiter.try_acquire().is_some());
        assert!(InFlight::new(0).try_acquire().is_none());
    }

    #[test]
    fn query_strings_are_ignored_for_routing() {
        assert_eq!(request_path("/message?sessionId=1"), "/message");
        assert_eq!(request_path("/mcp"), "/mcp");
    }
}
