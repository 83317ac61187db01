use anyhow::{Result, anyhow};
use serde_json::json;
use uuid::Uuid;

use crate::SessionsCmd;
use crate::context::CliContext;
use crate::output::*;

pub(crate) fn run_sessions(ctx: &CliContext, cmd: SessionsCmd, json_mode: bool) -> Result<()> {
    let core = ctx.core();
    match cmd {
        SessionsCmd::List => {
            let sessions: Vec<_> = core
                .sessions()
                .list()
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "title": s.title,
                        "agent": s.agent,
                        "parent_id": s.parent_id,
                        "fork": s.is_fork(),
                        "messages": s.messages.len(),
                        "compactions": s.compactions.len(),
                        "updated_at": s.updated_at,
                    })
                })
                .collect();
            if json_mode {
                print_json(&sessions)?;
            } else if sessions.is_empty() {
                println!("No sessions.");
            } else {
                for s in &sessions {
                    let marker = if s["fork"] == true { " (fork)" } else { "" };
                    println!(
                        "{}  {:<8} {:>4} msgs  {}{marker}",
                        s["id"].as_str().unwrap_or_default(),
                        s["agent"].as_str().unwrap_or_default(),
                        s["messages"],
                        s["title"].as_str().unwrap_or_default(),
                    );
                }
            }
        }
        SessionsCmd::Create(args) => {
            let session =
                ctx.block_on(core.create_session(args.title.as_deref(), args.agent.as_deref()));
            if json_mode {
                print_json(&session)?;
            } else {
                println!("created session {} ({})", session.id, session.agent);
            }
        }
        SessionsCmd::Fork(args) => {
            let parent = parse_id(&args.session_id)?;
            let fork = ctx
                .block_on(core.fork_session(parent, args.at))
                .ok_or_else(|| anyhow!("session not found: {parent}"))?;
            if json_mode {
                print_json(&fork)?;
            } else {
                println!(
                    "forked {parent} into {} at message {}",
                    fork.id,
                    fork.fork_point.unwrap_or_default()
                );
            }
        }
        SessionsCmd::Compact(args) => {
            let id = parse_id(&args.session_id)?;
            let record = ctx.block_on(core.compact_session(id, args.keep))?;
            if json_mode {
                print_json(&json!({ "session_id": id, "compaction": record }))?;
            } else {
                match record {
                    Some(record) => println!(
                        "compacted {} messages of session {id}",
                        record.messages_replaced
                    ),
                    None => println!("nothing to compact in session {id}"),
                }
            }
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| anyhow!("invalid session id: {raw}"))
}
