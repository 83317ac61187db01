use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::ToolsCmd;
use crate::context::{CliContext, parse_session};
use crate::output::*;

pub(crate) fn run_tools(ctx: &CliContext, cmd: ToolsCmd, json_mode: bool) -> Result<()> {
    match cmd {
        ToolsCmd::List(args) => {
            let registry = ctx.core().tools();
            let tools = match (&args.category, args.all) {
                (Some(category), true) => registry.list_by_category(category),
                (Some(category), false) => registry
                    .list_by_category(category)
                    .into_iter()
                    .filter(|d| d.is_visible())
                    .collect(),
                (None, true) => registry.list(),
                (None, false) => registry.list_visible(),
            };
            if json_mode {
                print_json(&tools)?;
            } else if tools.is_empty() {
                println!("No tools registered.");
            } else {
                println!("{:<22} {:<10} DESCRIPTION", "NAME", "CATEGORY");
                println!("{}", "-".repeat(78));
                for tool in &tools {
                    println!(
                        "{:<22} {:<10} {}",
                        tool.name,
                        tool.category,
                        truncate_str(&tool.description, 44)
                    );
                }
            }
            Ok(())
        }
        ToolsCmd::Call(args) => {
            let arguments: Value = serde_json::from_str(&args.args)
                .map_err(|e| anyhow!("--args is not valid JSON: {e}"))?;
            let session_id = parse_session(args.session.as_deref())?;
            let result = ctx.block_on(ctx.core().execute_tool(&args.name, arguments, session_id));
            if json_mode {
                print_json(&json!({ "result": result }))?;
            } else if result.success {
                println!("{}", result.output);
                for path in &result.created_files {
                    println!("created {path}");
                }
            } else {
                eprintln!("{}: {}", result.tool_name, result.display_text());
            }
            if result.success {
                Ok(())
            } else {
                Err(anyhow!("tool call failed: {}", result.display_text()))
            }
        }
    }
}
