use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zima_core::{EventKind, EventSink};
use zima_jsonrpc::{RpcHandler, handle_bytes};

use crate::{Transport, TransportKind};

/// Serve newline-delimited JSON-RPC until EOF or cancellation. Blank lines
/// are ignored and notifications produce no output line. A bad line gets an
/// error response; only I/O failures end the loop.
pub async fn run_stdio<R, W>(
    handler: &dyn RpcHandler,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read?,
        };
        if read == 0 {
            break;
        }
        if line.trim_ascii().is_empty() {
            continue;
        }
        let response = handle_bytes(handler, &line).await;
        if response.is_empty() {
            continue;
        }
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

pub struct StdioTransport {
    handler: Arc<dyn RpcHandler>,
    sink: Arc<dyn EventSink>,
    stop_timeout: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(handler: Arc<dyn RpcHandler>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            handler,
            sink,
            stop_timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.cancel = CancellationToken::new();
        let handler = self.handler.clone();
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            let writer = tokio::io::stdout();
            if let Err(err) = run_stdio(handler.as_ref(), reader, writer, cancel).await {
                tracing::error!(error = %err, "stdio transport failed");
            }
        }));
        self.sink.publish(EventKind::TransportStartedV1 {
            transport: TransportKind::Stdio.to_string(),
            endpoint: "stdio".to_string(),
        });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.cancel.cancel();
        if tokio::time::timeout(self.stop_timeout, task).await.is_err() {
            tracing::warn!(transport = "stdio", "transport did not stop in time");
        }
        self.sink.publish(EventKind::TransportStoppedV1 {
            transport: TransportKind::Stdio.to_string(),
        });
    }

    /// False once stdin reaches EOF.
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn endpoint(&self) -> Option<String> {
        self.is_running().then(|| "stdio".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use zima_jsonrpc::JsonRpcError;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
            if method == "panic" {
                panic!("echo handler exploded");
            }
            Ok(params)
        }
    }

    #[tokio::test]
    async fn answers_each_request_line_in_order() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"a","params":{"n":1}}"#,
            "\n\n   \n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"b","params":{"n":2}}"#,
            "\n",
        );
        let mut output = Vec::new();

        run_stdio(&Echo, input.as_bytes(), &mut output, CancellationToken::new())
            .await
            .expect("serve");

        let lines: Vec<Value> = String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[0]["result"], json!({"n": 1}));
        assert_eq!(lines[1]["id"], 2);
    }

    #[tokio::test]
    async fn garbage_lines_get_parse_errors() {
        let mut output = Vec::new();
        run_stdio(&Echo, &b"hello\n"[..], &mut output, CancellationToken::new())
            .await
            .expect("serve");
        let line: Value = serde_json::from_slice(output.trim_ascii()).expect("json");
        assert_eq!(line["error"]["code"], -32700);
    }

    fn replies(output: Vec<u8>) -> Vec<Value> {
        String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_stop_the_loop() {
        let mut input = b"\xff\xfe\n".to_vec();
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":7,"method":"a","params":{"ok":true}}"#);
        input.push(b'\n');
        let mut output = Vec::new();

        run_stdio(&Echo, input.as_slice(), &mut output, CancellationToken::new())
            .await
            .expect("serve");

        let lines = replies(output);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["error"]["code"], -32700);
        assert_eq!(lines[0]["id"], Value::Null);
        assert_eq!(lines[1]["id"], 7);
        assert_eq!(lines[1]["result"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn panicking_handler_is_answered_and_serving_continues() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"panic"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"a","params":[2]}"#,
            "\n",
        );
        let mut output = Vec::new();

        let served = tokio::spawn(async move {
            run_stdio(&Echo, input.as_bytes(), &mut output, CancellationToken::new())
                .await
                .map(|()| output)
        })
        .await
        .expect("stdio task survives the panic");

        let lines = replies(served.expect("serve"));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[0]["error"]["code"], -32603);
        assert_eq!(lines[1]["result"], json!([2]));
    }

    #[tokio::test]
    async fn cancellation_ends_the_loop() {
        let (_client, server) = tokio::io::duplex(64);
        let (read_half, _write_half) = tokio::io::split(server);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut output = Vec::new();

        run_stdio(&Echo, BufReader::new(read_half), &mut output, cancel)
            .await
            .expect("serve");

        assert!(output.is_empty());
    }
}
