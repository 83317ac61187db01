use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::agents::run_agents;
use commands::permissions::run_permissions;
use commands::serve::{run_completions, run_serve};
use commands::sessions::run_sessions;
use commands::tools::run_tools;
use context::CliContext;

#[derive(Parser)]
#[command(name = "zima")]
#[command(about = "Zima file service: tools, permissions and sessions over MCP", long_about = None)]
struct Cli {
    /// Emit machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the tool registry over MCP.
    Serve(ServeArgs),
    Tools {
        #[command(subcommand)]
        command: ToolsCmd,
    },
    Permissions {
        #[command(subcommand)]
        command: PermissionsCmd,
    },
    Agents {
        #[command(subcommand)]
        command: AgentsCmd,
    },
    Sessions {
        #[command(subcommand)]
        command: SessionsCmd,
    },
    /// Generate shell completion scripts.
    Completions(CompletionsArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TransportArg {
    Stdio,
    Http,
    Sse,
    All,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, value_enum, default_value = "stdio")]
    transport: TransportArg,
    /// HTTP port (overrides `server.http_port`).
    #[arg(long)]
    port: Option<u16>,
    /// SSE port (overrides `server.sse_port`).
    #[arg(long)]
    sse_port: Option<u16>,
}

#[derive(Args)]
struct CompletionsArgs {
    /// Shell to generate completions for (bash, zsh, fish, powershell, elvish).
    #[arg(long)]
    shell: Shell,
}

#[derive(Subcommand)]
enum ToolsCmd {
    /// List registered tools.
    List(ToolsListArgs),
    /// Execute a tool through the full hook and permission pipeline.
    Call(ToolsCallArgs),
}

#[derive(Args)]
struct ToolsListArgs {
    /// Include hidden and disabled tools.
    #[arg(long)]
    all: bool,
    /// Only tools in this category (case-insensitive).
    #[arg(long)]
    category: Option<String>,
}

#[derive(Args)]
struct ToolsCallArgs {
    name: String,
    /// Arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    args: String,
    #[arg(long)]
    session: Option<String>,
}

#[derive(Subcommand)]
enum PermissionsCmd {
    /// Show global rules and active approvals.
    List,
    /// Evaluate a permission without prompting.
    Check(PermissionsCheckArgs),
}

#[derive(Args)]
struct PermissionsCheckArgs {
    permission: String,
    #[arg(default_value = "*")]
    value: String,
    #[arg(long)]
    session: Option<String>,
}

#[derive(Subcommand)]
enum AgentsCmd {
    List,
}

#[derive(Subcommand)]
enum SessionsCmd {
    List,
    Create(SessionCreateArgs),
    Fork(SessionForkArgs),
    Compact(SessionCompactArgs),
}

#[derive(Args)]
struct SessionCreateArgs {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    agent: Option<String>,
}

#[derive(Args)]
struct SessionForkArgs {
    session_id: String,
    /// Number of leading messages to copy (all by default).
    #[arg(long)]
    at: Option<usize>,
}

#[derive(Args)]
struct SessionCompactArgs {
    session_id: String,
    /// Messages to keep verbatim (configured default otherwise).
    #[arg(long)]
    keep: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Completions(args) = cli.command {
        return run_completions(args);
    }

    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let ctx = CliContext::open(&workspace)?;

    let outcome = match cli.command {
        Commands::Serve(args) => run_serve(&ctx, args, cli.json),
        Commands::Tools { command } => run_tools(&ctx, command, cli.json),
        Commands::Permissions { command } => run_permissions(&ctx, command, cli.json),
        Commands::Agents { command } => run_agents(&ctx, command, cli.json),
        Commands::Sessions { command } => run_sessions(&ctx, command, cli.json),
        Commands::Completions(_) => Ok(()),
    };
    ctx.close();
    outcome
}
