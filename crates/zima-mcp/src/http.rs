use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tiny_http::{Method, Request, Server};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use zima_core::{EventKind, EventSink, ServerConfig};
use zima_jsonrpc::{RpcHandler, handle_bytes};

use crate::{InFlight, Transport, TransportKind, cors, join_with_timeout, request_path};

struct Listener {
    server: Arc<Server>,
    thread: JoinHandle<()>,
    cancel: CancellationToken,
    addr: SocketAddr,
}

/// JSON-RPC over plain HTTP POST on a single path.
pub struct HttpTransport {
    handler: Arc<dyn RpcHandler>,
    sink: Arc<dyn EventSink>,
    bind: String,
    port: u16,
    path: String,
    stop_timeout: Duration,
    max_in_flight: usize,
    listener: Option<Listener>,
}

impl HttpTransport {
    pub fn new(handler: Arc<dyn RpcHandler>, sink: Arc<dyn EventSink>, config: &ServerConfig) -> Self {
        Self {
            handler,
            sink,
            bind: config.bind.clone(),
            port: config.http_port,
            path: normalize_path(&config.http_path),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            max_in_flight: config.max_in_flight,
            listener: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    /// The bound address, once started. Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.addr)
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let requested = format!("{}:{}", self.bind, self.port);
        let server = Server::http(requested.as_str())
            .map_err(|e| anyhow!("failed to bind http transport on {requested}: {e}"))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("http transport is not bound to an IP address"))?;
        let server = Arc::new(server);
        let cancel = CancellationToken::new();

        let thread = {
            let server = server.clone();
            let cancel = cancel.clone();
            let handler = self.handler.clone();
            let path = self.path.clone();
            let runtime = Handle::current();
            let in_flight = InFlight::new(self.max_in_flight);
            std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(permit) = in_flight.try_acquire() else {
                        tracing::warn!(active = in_flight.active(), "http transport busy, rejecting request");
                        if let Err(err) = request.respond(cors::status(503)) {
                            tracing::debug!(error = %err, "failed to send http response");
                        }
                        continue;
                    };
                    let handler = handler.clone();
                    let path = path.clone();
                    let runtime = runtime.clone();
                    std::thread::spawn(move || {
                        let _permit = permit;
                        serve(request, &path, handler.as_ref(), &runtime);
                    });
                }
            })
        };

        self.listener = Some(Listener {
            server,
            thread,
            cancel,
            addr,
        });
        let endpoint = self.endpoint().unwrap_or_default();
        tracing::info!(endpoint = %endpoint, "http transport listening");
        self.sink.publish(EventKind::TransportStartedV1 {
            transport: TransportKind::Http.to_string(),
            endpoint,
        });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        listener.cancel.cancel();
        listener.server.unblock();
        join_with_timeout(listener.thread, self.stop_timeout, "http").await;
        self.sink.publish(EventKind::TransportStoppedV1 {
            transport: TransportKind::Http.to_string(),
        });
    }

    fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    fn endpoint(&self) -> Option<String> {
        self.listener
            .as_ref()
            .map(|l| format!("http://{}{}", l.addr, self.path))
    }
}

fn serve(mut request: Request, path: &str, handler: &dyn RpcHandler, runtime: &Handle) {
    let response = if request_path(request.url()) != path {
        cors::status(404)
    } else {
        match request.method() {
            Method::Options => cors::status(204),
            Method::Post => {
                let mut body = Vec::new();
                match request.as_reader().read_to_end(&mut body) {
                    Ok(_) => {
                        let reply = runtime.block_on(handle_bytes(handler, &body));
                        if reply.is_empty() {
                            cors::status(202)
                        } else {
                            cors::json(reply)
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "failed to read request body");
                        cors::status(400)
                    }
                }
            }
            _ => cors::status(405),
        }
    };
    if let Err(err) = request.respond(response) {
        tracing::debug!(error = %err, "failed to send http response");
    }
}
