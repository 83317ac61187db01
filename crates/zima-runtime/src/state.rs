//! Loading and saving the workspace's persisted state. Each store is handled
//! independently; a failure in one is logged and recorded in the report.

use anyhow::Result;
use serde::Serialize;

use crate::ZimaCore;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateReport {
    pub agents: usize,
    pub rules: usize,
    pub plugins: usize,
    pub tools: usize,
    pub sessions: usize,
    pub errors: Vec<String>,
}

impl StateReport {
    fn track(&mut self, what: &str, outcome: Result<usize>) -> usize {
        match outcome {
            Ok(n) => n,
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(store = what, error = %message, "state store failed");
                self.errors.push(format!("{what}: {message}"));
                0
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ZimaCore {
    /// Load agents, permission rules, plugin metadata, tool definitions and
    /// session snapshots from the configured storage paths.
    pub fn load_state(&self) -> StateReport {
        let ws = self.workspace();
        let storage = &self.config().storage;
        let mut report = StateReport::default();

        report.agents = report.track("agents", self.agents().load_from_file(&storage.agents_path(ws)));
        report.rules = report.track(
            "permissions",
            self.policy().load_rules(&storage.permissions_path(ws)),
        );
        report.plugins = report.track("plugins", self.hooks().load_plugins(&storage.plugins_path(ws)));
        report.tools = report.track("tools", self.tools().load_from_dir(&storage.tools_path(ws)));
        report.sessions = report.track(
            "sessions",
            self.sessions().load_snapshot(&storage.sessions_path(ws)),
        );

        // Restored sessions need their agent's rules back in the policy.
        for session in self.sessions().list() {
            let rules = self
                .agents()
                .get(&session.agent)
                .map(|a| a.permissions)
                .unwrap_or_default();
            self.policy().set_agent_rules(session.id, rules);
        }

        tracing::info!(
            agents = report.agents,
            rules = report.rules,
            plugins = report.plugins,
            tools = report.tools,
            sessions = report.sessions,
            "state loaded"
        );
        report
    }

    pub fn save_state(&self) -> StateReport {
        let ws = self.workspace();
        let storage = &self.config().storage;
        let mut report = StateReport::default();

        report.agents = report.track(
            "agents",
            self.agents()
                .save_to_file(&storage.agents_path(ws))
                .map(|()| self.agents().list().iter().filter(|a| !a.builtin).count()),
        );
        report.rules = report.track(
            "permissions",
            self.policy()
                .save_rules(&storage.permissions_path(ws))
                .map(|()| self.policy().rules().len()),
        );
        report.plugins = report.track(
            "plugins",
            self.hooks()
                .save_plugins(&storage.plugins_path(ws))
                .map(|()| self.hooks().plugins().len()),
        );
        report.tools = report.track("tools", self.tools().save_to_dir(&storage.tools_path(ws)));
        report.sessions = report.track(
            "sessions",
            self.sessions().save_snapshot(&storage.sessions_path(ws)),
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_collected_not_raised() {
        let mut report = StateReport::default();
        let ok = report.track("agents", Ok(3));
        let failed = report.track("sessions", Err(anyhow::anyhow!("bad json")));
        assert_eq!((ok, failed), (3, 0));
        assert!(!report.is_clean());
        assert_eq!(report.errors, vec!["sessions: bad json".to_string()]);
    }
}
