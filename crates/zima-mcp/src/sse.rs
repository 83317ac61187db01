use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tiny_http::{Method, Request, Server};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zima_core::{EventKind, EventSink, ServerConfig};
use zima_jsonrpc::{RpcHandler, handle_bytes};

use crate::{InFlight, Permit, Transport, TransportKind, cors, join_with_timeout, request_path};

const STREAM_HEAD: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\r\n";

pub(crate) fn frame(event: &str, data: &str) -> String {
    let mut out = format!("event: {event}\n");
    for line in data.lines() {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Open event streams, keyed by client id. Each stream has a bounded queue.
struct Clients {
    streams: Mutex<HashMap<Uuid, SyncSender<String>>>,
    queue: usize,
}

impl Clients {
    fn new(queue: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            queue: queue.max(1),
        }
    }

    fn connect(&self) -> (Uuid, Receiver<String>) {
        let (tx, rx) = mpsc::sync_channel(self.queue);
        let id = Uuid::now_v7();
        self.streams.lock().expect("sse clients lock").insert(id, tx);
        (id, rx)
    }

    fn remove(&self, id: Uuid) {
        self.streams.lock().expect("sse clients lock").remove(&id);
    }

    /// Queue `frame` for every client without blocking. Clients whose stream
    /// is gone or whose queue is full are dropped. Returns how many received it.
    fn broadcast(&self, frame: &str) -> usize {
        let mut streams = self.streams.lock().expect("sse clients lock");
        streams.retain(|id, tx| match tx.try_send(frame.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client = %id, "sse client lagging, dropping it");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        streams.len()
    }

    fn count(&self) -> usize {
        self.streams.lock().expect("sse clients lock").len()
    }

    /// Drop every sender so the stream threads see a disconnect and exit.
    fn close_all(&self) {
        self.streams.lock().expect("sse clients lock").clear();
    }
}

struct Routes {
    stream: String,
    message: String,
}

impl Routes {
    fn new(base: &str) -> Self {
        let base = base.trim().trim_end_matches('/');
        let base = if base.is_empty() || base.starts_with('/') {
            base.to_string()
        } else {
            format!("/{base}")
        };
        Self {
            stream: format!("{base}/sse"),
            message: format!("{base}/message"),
        }
    }
}

struct Listener {
    server: Arc<Server>,
    thread: JoinHandle<()>,
    cancel: CancellationToken,
    addr: SocketAddr,
}

/// MCP over server-sent events: clients hold a `GET /sse` stream open and
/// POST requests to `/message`. Responses are returned directly and also
/// broadcast on every open stream.
pub struct SseTransport {
    handler: Arc<dyn RpcHandler>,
    sink: Arc<dyn EventSink>,
    bind: String,
    port: u16,
    routes: Arc<Routes>,
    heartbeat: Duration,
    stop_timeout: Duration,
    max_in_flight: usize,
    clients: Arc<Clients>,
    listener: Option<Listener>,
}

impl SseTransport {
    pub fn new(handler: Arc<dyn RpcHandler>, sink: Arc<dyn EventSink>, config: &ServerConfig) -> Self {
        Self {
            handler,
            sink,
            bind: config.bind.clone(),
            port: config.sse_port,
            routes: Arc::new(Routes::new(&config.sse_path)),
            heartbeat: Duration::from_secs(config.heartbeat_seconds.max(1)),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            max_in_flight: config.max_in_flight,
            clients: Arc::new(Clients::new(config.sse_client_queue)),
            listener: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.addr)
    }

    pub fn client_count(&self) -> usize {
        self.clients.count()
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn start(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let requested = format!("{}:{}", self.bind, self.port);
        let server = Server::http(requested.as_str())
            .map_err(|e| anyhow!("failed to bind sse transport on {requested}: {e}"))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("sse transport is not bound to an IP address"))?;
        let server = Arc::new(server);
        let cancel = CancellationToken::new();

        let thread = {
            let server = server.clone();
            let cancel = cancel.clone();
            let in_flight = InFlight::new(self.max_in_flight);
            let ctx = Arc::new(StreamContext {
                handler: self.handler.clone(),
                routes: self.routes.clone(),
                clients: self.clients.clone(),
                heartbeat: self.heartbeat,
                runtime: Handle::current(),
            });
            std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(permit) = in_flight.try_acquire() else {
                        tracing::warn!(active = in_flight.active(), "sse transport busy, rejecting request");
                        if let Err(err) = request.respond(cors::status(503)) {
                            tracing::debug!(error = %err, "failed to send sse response");
                        }
                        continue;
                    };
                    let ctx = ctx.clone();
                    std::thread::spawn(move || ctx.serve(request, permit));
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
        tracing::info!(endpoint = %endpoint, "sse transport listening");
        self.sink.publish(EventKind::TransportStartedV1 {
            transport: TransportKind::Sse.to_string(),
            endpoint,
        });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        listener.cancel.cancel();
        self.clients.close_all();
        listener.server.unblock();
        join_with_timeout(listener.thread, self.stop_timeout, "sse").await;
        self.sink.publish(EventKind::TransportStoppedV1 {
            transport: TransportKind::Sse.to_string(),
        });
    }

    fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    fn endpoint(&self) -> Option<String> {
        self.listener
            .as_ref()
            .map(|l| format!("http://{}{}", l.addr, self.routes.stream))
    }
}

struct StreamContext {
    handler: Arc<dyn RpcHandler>,
    routes: Arc<Routes>,
    clients: Arc<Clients>,
    heartbeat: Duration,
    runtime: Handle,
}

impl StreamContext {
    fn serve(&self, mut request: Request, permit: Permit) {
        let path = request_path(request.url()).to_string();
        let method = request.method().clone();
        let response = if path == self.routes.stream {
            match method {
                Method::Get => return self.stream(request, permit),
                Method::Options => cors::status(204),
                _ => cors::status(405),
            }
        } else if path == self.routes.message {
            match method {
                Method::Post => self.message(&mut request),
                Method::Options => cors::status(204),
                _ => cors::status(405),
            }
        } else {
            cors::status(404)
        };
        if let Err(err) = request.respond(response) {
            tracing::debug!(error = %err, "failed to send sse response");
        }
    }

    fn message(&self, request: &mut Request) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
        let mut body = Vec::new();
        if let Err(err) = request.as_reader().read_to_end(&mut body) {
            tracing::debug!(error = %err, "failed to read message body");
            return cors::status(400);
        }
        let reply = self.runtime.block_on(handle_bytes(self.handler.as_ref(), &body));
        if reply.is_empty() {
            return cors::status(202);
        }
        let delivered = self.clients.broadcast(&frame("message", &reply));
        tracing::debug!(clients = delivered, "broadcast sse message");
        cors::json(reply)
    }

    /// Hold the connection open, writing queued frames and heartbeats until
    /// the client goes away or the transport stops. The permit is held for
    /// the life of the stream.
    fn stream(&self, request: Request, _permit: Permit) {
        let (id, frames) = self.clients.connect();
        let mut writer = request.into_writer();
        let opened = writer
            .write_all(STREAM_HEAD.as_bytes())
            .and_then(|()| writer.write_all(frame("endpoint", &self.routes.message).as_bytes()))
            .and_then(|()| writer.flush());
        if opened.is_ok() {
            loop {
                let chunk = match frames.recv_timeout(self.heartbeat) {
                    Ok(frame) => frame,
                    Err(RecvTimeoutError::Timeout) => ": heartbeat\n\n".to_string(),
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if writer
                    .write_all(chunk.as_bytes())
                    .and_then(|()| writer.flush())
                    .is_err()
                {
                    break;
                }
            }
        }
        self.clients.remove(id);
        tracing::debug!(client = %id, "sse client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_multiline_data() {
        assert_eq!(frame("message", "{}"), "event: message\ndata: {}\n\n");
        assert_eq!(frame("x", "a\nb"), "event: x\ndata: a\ndata: b\n\n");
    }

    #[test]
    fn routes_honour_the_base_path() {
        let root = Routes::new("");
        assert_eq!((root.stream.as_str(), root.message.as_str()), ("/sse", "/message"));
        let nested = Routes::new("mcp/");
        assert_eq!(nested.stream, "/mcp/sse");
        assert_eq!(nested.message, "/mcp/message");
    }

    #[test]
    fn broadcast_reaps_dropped_streams() {
        let clients = Clients::new(4);
        let (_a, rx_a) = clients.connect();
        let (_b, rx_b) = clients.connect();
        drop(rx_b);

        assert_eq!(clients.broadcast("ping"), 1);
        assert_eq!(clients.count(), 1);
        assert_eq!(rx_a.try_recv().as_deref(), Ok("ping"));

        clients.close_all();
        assert_eq!(
            rx_a.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn lagging_clients_are_dropped_once_their_queue_fills() {
        let clients = Clients::new(2);
        let (_slow, rx_slow) = clients.connect();
        let (_fast, rx_fast) = clients.connect();

        assert_eq!(clients.broadcast("one"), 2);
        assert_eq!(rx_fast.try_recv().as_deref(), Ok("one"));
        assert_eq!(clients.broadcast("two"), 2);
        assert_eq!(rx_fast.try_recv().as_deref(), Ok("two"));
        assert_eq!(clients.broadcast("three"), 1);

        assert_eq!(clients.count(), 1);
        assert_eq!(rx_fast.try_recv().as_deref(), Ok("three"));
        let queued: Vec<String> = rx_slow.try_iter().collect();
        assert_eq!(queued, ["one", "two"]);
    }
}
