use anyhow::{Result, bail};
use clap::CommandFactory;
use clap_complete::generate;
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use zima_jsonrpc::{McpHandler, RpcHandler};
use zima_mcp::{HttpTransport, SseTransport, StdioTransport, TransportKind, TransportManager};

use crate::context::CliContext;
use crate::{Cli, CompletionsArgs, ServeArgs, TransportArg};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) fn run_completions(args: CompletionsArgs) -> Result<()> {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "zima", &mut io::stdout());
    Ok(())
}

/// Serve until interrupted, or until stdin closes when stdio is one of the
/// transports. Status goes to stderr since stdout may carry the protocol.
pub(crate) fn run_serve(ctx: &CliContext, args: ServeArgs, json_mode: bool) -> Result<()> {
    let core = ctx.core().clone();
    let handler: Arc<dyn RpcHandler> = Arc::new(McpHandler::new(core.clone()));
    let sink = core.sink().clone();
    let server = &core.config().server;

    let mut manager = TransportManager::new();
    let wants = |kind: TransportArg| args.transport == kind || args.transport == TransportArg::All;
    if wants(TransportArg::Stdio) {
        manager.add(Box::new(StdioTransport::new(handler.clone(), sink.clone())));
    }
    if wants(TransportArg::Http) {
        let http = HttpTransport::new(handler.clone(), sink.clone(), server);
        manager.add(Box::new(match args.port {
            Some(port) => http.with_port(port),
            None => http,
        }));
    }
    if wants(TransportArg::Sse) {
        let sse = SseTransport::new(handler.clone(), sink.clone(), server);
        manager.add(Box::new(match args.sse_port {
            Some(port) => sse.with_port(port),
            None => sse,
        }));
    }

    let results = ctx.block_on(manager.start_all());
    for (kind, outcome) in &results {
        if let Err(err) = outcome {
            eprintln!("zima: {kind} transport failed to start: {err:#}");
        }
    }
    if !manager.any_running() {
        bail!("no transport could be started");
    }
    let status = manager.status();
    if json_mode {
        eprintln!("{}", json!({"status": "serving", "transports": status}));
    } else {
        for s in &status {
            eprintln!(
                "zima: {} transport on {}",
                s.kind,
                s.endpoint.as_deref().unwrap_or("-")
            );
        }
    }

    let has_stdio = status.iter().any(|s| s.kind == TransportKind::Stdio);
    ctx.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    let stdio_closed = has_stdio
                        && manager
                            .status()
                            .iter()
                            .any(|s| s.kind == TransportKind::Stdio && !s.running);
                    if stdio_closed {
                        break;
                    }
                }
            }
        }
        manager.stop_all().await;
    });
    tracing::info!("server stopped");
    Ok(())
}
