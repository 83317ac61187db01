use anyhow::Result;
use serde_json::json;

use crate::PermissionsCmd;
use crate::context::{CliContext, parse_session};
use crate::output::*;

pub(crate) fn run_permissions(ctx: &CliContext, cmd: PermissionsCmd, json_mode: bool) -> Result<()> {
    let policy = ctx.core().policy();
    match cmd {
        PermissionsCmd::List => {
            let rules = policy.rules();
            let approvals = policy.approvals(None);
            if json_mode {
                print_json(&json!({
                    "rules": rules,
                    "approvals": approvals,
                    "approval_ttl_seconds": policy.ttl().num_seconds(),
                }))?;
            } else if rules.is_empty() {
                println!("No global rules; everything is allowed.");
            } else {
                for (idx, rule) in rules.iter().enumerate() {
                    println!(
                        "{idx:>3}. {:<6} {} {}",
                        rule.action.to_string(),
                        rule.permission,
                        rule.pattern
                    );
                }
            }
        }
        PermissionsCmd::Check(args) => {
            let session_id = parse_session(args.session.as_deref())?;
            let action = policy.evaluate(&args.permission, &args.value, session_id);
            if json_mode {
                print_json(&json!({
                    "permission": args.permission,
                    "value": args.value,
                    "session_id": session_id,
                    "action": action,
                }))?;
            } else {
                println!("{} {} -> {action}", args.permission, args.value);
            }
        }
    }
    Ok(())
}
