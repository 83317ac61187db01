//! Agent catalog: named presets that carry a prompt template, sampling
//! settings and agent-scoped permission rules.
//!
//! Builtin agents are installed at construction. Agents loaded from JSON are
//! layered on top; the last registration under a name wins.

use anyhow::{Result, anyhow};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use zima_core::{AgentInfo, AgentMode, DEFAULT_AGENT, PermissionAction, PermissionRule, ToolDefinition};
use zima_policy::wildcard_match;

/// Tool families that write to the workspace.
const MUTATING_TOOLS: &[&str] = &["write_*", "create_*", "merge_*", "delete_*", "convert_*"];

fn builtin(name: &str, mode: AgentMode, description: &str, prompt: &str) -> AgentInfo {
    AgentInfo {
        description: description.to_string(),
        prompt: prompt.to_string(),
        builtin: true,
        ..AgentInfo::new(name, mode)
    }
}

pub fn builtin_agents() -> Vec<AgentInfo> {
    let mut build = builtin(
        "build",
        AgentMode::Primary,
        "Default agent with the full tool set.",
        "You are Zima, a document assistant working in {{workspace}}. \
         Use the available tools to read, create and edit files. \
         Report every file you create.",
    );
    build.color = Some("blue".to_string());

    let mut plan = builtin(
        "plan",
        AgentMode::Primary,
        "Analyses requests and proposes steps without modifying files.",
        "You are Zima in planning mode. Inspect files in {{workspace}} and \
         describe the changes you would make. Do not modify anything.",
    );
    plan.color = Some("yellow".to_string());
    plan.permissions = MUTATING_TOOLS
        .iter()
        .map(|family| PermissionRule::deny(*family, "*"))
        .collect();

    let mut explore = builtin(
        "explore",
        AgentMode::Subagent,
        "Read-only agent for locating files and summarising their content.",
        "Find and read the files relevant to: {{task}}. Do not modify anything.",
    );
    explore.max_steps = Some(25);
    explore.permissions = vec![
        PermissionRule::allow("list_*", "*"),
        PermissionRule::allow("read_*", "*"),
        PermissionRule::deny("*", "*"),
    ];

    let general = builtin(
        "general",
        AgentMode::Subagent,
        "General-purpose subagent for multi-step tasks.",
        "Complete the following task using the available tools: {{task}}",
    );

    let hidden_rules = vec![PermissionRule::deny("*", "*")];
    let mut compaction = builtin(
        "compaction",
        AgentMode::Hidden,
        "Summarises older conversation history.",
        "Summarise the conversation so far. Keep file names, decisions and open requests.",
    );
    compaction.permissions = hidden_rules.clone();
    compaction.temperature = Some(0.0);

    let mut title = builtin(
        "title",
        AgentMode::Hidden,
        "Generates short session titles.",
        "Write a title of at most six words for: {{message}}",
    );
    title.permissions = hidden_rules.clone();
    title.temperature = Some(0.3);

    let mut summary = builtin(
        "summary",
        AgentMode::Hidden,
        "Summarises a finished session.",
        "Summarise what was done in this session and list the files produced.",
    );
    summary.permissions = hidden_rules;

    vec![build, plan, explore, general, compaction, title, summary]
}

pub struct AgentCatalog {
    agents: Mutex<BTreeMap<String, AgentInfo>>,
    default_agent: String,
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::with_default(DEFAULT_AGENT)
    }

    /// A catalog whose default agent is `name`. Falls back to `build` when no
    /// builtin carries that name and nothing registers it later.
    pub fn with_default(name: &str) -> Self {
        let agents = builtin_agents()
            .into_iter()
            .map(|agent| (agent.name.clone(), agent))
            .collect();
        Self {
            agents: Mutex::new(agents),
            default_agent: name.to_string(),
        }
    }

    pub fn register(&self, agent: AgentInfo) {
        tracing::debug!(agent = %agent.name, "registering agent");
        self.agents
            .lock()
            .expect("agent catalog lock")
            .insert(agent.name.clone(), agent);
    }

    pub fn get(&self, name: &str) -> Option<AgentInfo> {
        self.agents
            .lock()
            .expect("agent catalog lock")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents
            .lock()
            .expect("agent catalog lock")
            .contains_key(name)
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        self.agents
            .lock()
            .expect("agent catalog lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_by_mode(&self, mode: AgentMode) -> Vec<AgentInfo> {
        self.agents
            .lock()
            .expect("agent catalog lock")
            .values()
            .filter(|agent| agent.mode == mode)
            .cloned()
            .collect()
    }

    /// Removes an agent. The default agent cannot be removed.
    pub fn remove(&self, name: &str) -> Option<AgentInfo> {
        if name == self.default_agent {
            return None;
        }
        self.agents
            .lock()
            .expect("agent catalog lock")
            .remove(name)
    }

    pub fn default_name(&self) -> &str {
        &self.default_agent
    }

    pub fn default_agent(&self) -> AgentInfo {
        let agents = self.agents.lock().expect("agent catalog lock");
        agents
            .get(&self.default_agent)
            .or_else(|| agents.get(DEFAULT_AGENT))
            .cloned()
            .unwrap_or_else(|| AgentInfo::new(DEFAULT_AGENT, AgentMode::Primary))
    }

    /// Resolve `name` to a registered agent, or the default agent when the name
    /// is absent or unknown.
    pub fn resolve(&self, name: Option<&str>) -> AgentInfo {
        match name {
            Some(name) => self.get(name).unwrap_or_else(|| {
                tracing::warn!(agent = %name, "unknown agent, using default");
                self.default_agent()
            }),
            None => self.default_agent(),
        }
    }

    /// Tools the agent's own rules do not deny outright.
    pub fn tools_for(&self, agent: &str, tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
        let Some(agent) = self.get(agent) else {
            return tools;
        };
        tools
            .into_iter()
            .filter(|tool| {
                agent
                    .permissions
                    .iter()
                    .find(|rule| wildcard_match(&rule.permission, &tool.name))
                    .is_none_or(|rule| rule.action != PermissionAction::Deny)
            })
            .collect()
    }

    /// Load agents from a JSON array or an object with an `agents` array.
    /// Entries that do not parse are skipped. Returns how many were registered.
    pub fn load_from_file(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&raw)?;
        let entries = match doc {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("agents") {
                Some(Value::Array(items)) => items,
                _ => return Err(anyhow!("{}: expected an \"agents\" array", path.display())),
            },
            _ => return Err(anyhow!("{}: expected an array of agents", path.display())),
        };

        let mut loaded = 0;
        for entry in entries {
            match serde_json::from_value::<AgentInfo>(entry) {
                Ok(agent) => {
                    self.register(agent);
                    loaded += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping invalid agent entry");
                }
            }
        }
        Ok(loaded)
    }

    /// Writes every non-builtin agent as `{ "agents": [...] }`.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let custom: Vec<AgentInfo> = self.list().into_iter().filter(|a| !a.builtin).collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            path,
            serde_json::to_vec_pretty(&serde_json::json!({ "agents": custom }))?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_present_with_expected_modes() {
        let catalog = AgentCatalog::new();
        for name in ["build", "plan", "explore", "general", "compaction", "title", "summary"] {
            assert!(catalog.contains(name), "missing builtin {name}");
        }
        assert_eq!(catalog.default_agent().name, "build");
        let hidden: Vec<String> = catalog
            .list_by_mode(AgentMode::Hidden)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(hidden, vec!["compaction", "summary", "title"]);
    }

    #[test]
    fn last_registration_wins() {
        let catalog = AgentCatalog::new();
        let mut custom = AgentInfo::new("reviewer", AgentMode::Subagent);
        custom.description = "first".to_string();
        catalog.register(custom.clone());
        custom.description = "second".to_string();
        catalog.register(custom);
        assert_eq!(catalog.get("reviewer").expect("reviewer").description, "second");
    }

    #[test]
    fn unknown_agent_resolves_to_default() {
        let catalog = AgentCatalog::new();
        assert_eq!(catalog.resolve(Some("ghost")).name, "build");
        assert_eq!(catalog.resolve(Some("plan")).name, "plan");
        assert_eq!(catalog.resolve(None).name, "build");
    }

    #[test]
    fn default_agent_cannot_be_removed() {
        let catalog = AgentCatalog::new();
        assert!(catalog.remove("build").is_none());
        assert!(catalog.remove("title").is_some());
        assert!(!catalog.contains("title"));
    }

    #[test]
    fn plan_hides_mutating_tools() {
        let catalog = AgentCatalog::new();
        let tools = vec![
            ToolDefinition::new("read_text_file", ""),
            ToolDefinition::new("write_text_file", ""),
            ToolDefinition::new("delete_file", ""),
        ];
        let names: Vec<String> = catalog
            .tools_for("plan", tools.clone())
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["read_text_file"]);
        assert_eq!(catalog.tools_for("build", tools).len(), 3);
    }

    #[test]
    fn load_accepts_both_shapes_and_skips_bad_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wrapped = dir.path().join("wrapped.json");
        fs::write(
            &wrapped,
            r#"{"agents":[{"name":"excel","mode":"subagent","prompt":"Work on {{file}}"},{"name":42}]}"#,
        )
        .expect("write");
        let bare = dir.path().join("bare.json");
        fs::write(&bare, r#"[{"name":"pdf","mode":"primary"}]"#).expect("write");

        let catalog = AgentCatalog::new();
        assert_eq!(catalog.load_from_file(&wrapped).expect("wrapped"), 1);
        assert_eq!(catalog.load_from_file(&bare).expect("bare"), 1);
        assert_eq!(
            catalog
                .load_from_file(&dir.path().join("missing.json"))
                .expect("missing"),
            0
        );
        assert!(!catalog.get("excel").expect("excel").builtin);
    }

    #[test]
    fn save_writes_only_custom_agents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agents.json");
        let catalog = AgentCatalog::new();
        catalog.register(AgentInfo::new("reviewer", AgentMode::Subagent));
        catalog.save_to_file(&path).expect("save");

        let restored = AgentCatalog::new();
        assert_eq!(restored.load_from_file(&path).expect("load"), 1);
        assert!(restored.contains("reviewer"));
    }
}
