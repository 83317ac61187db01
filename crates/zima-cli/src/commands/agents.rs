use anyhow::Result;

use crate::AgentsCmd;
use crate::context::CliContext;
use crate::output::*;

pub(crate) fn run_agents(ctx: &CliContext, cmd: AgentsCmd, json_mode: bool) -> Result<()> {
    match cmd {
        AgentsCmd::List => {
            let agents = ctx.core().agents().list();
            if json_mode {
                print_json(&agents)?;
                return Ok(());
            }
            println!("{:<12} {:<10} {:<48} RULES", "NAME", "MODE", "DESCRIPTION");
            println!("{}", "-".repeat(78));
            let default = ctx.core().agents().default_name().to_string();
            for agent in &agents {
                let marker = if agent.name == default { "*" } else { "" };
                println!(
                    "{:<12} {:<10} {:<48} {}",
                    format!("{}{marker}", agent.name),
                    format!("{:?}", agent.mode).to_lowercase(),
                    truncate_str(&agent.description, 46),
                    agent.permissions.len(),
                );
            }
        }
    }
    Ok(())
}
