//! The orchestration facade. `ZimaCore` owns every subsystem and is the only
//! thing transports talk to.

use anyhow::Result;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use uuid::Uuid;
use zima_agent::AgentCatalog;
use zima_core::{
    AppConfig, CompactionRecord, EventKind, EventSink, Message, PermissionAction, Session,
    ToolDefinition, ToolResult, ZimaError,
};
use zima_hooks::{HookBus, HookPoint};
use zima_observe::Observer;
use zima_policy::{Approver, AutoApprover, PermissionEvaluator, PermissionRequest};
use zima_store::{DigestSummarizer, SessionStore, Summarizer};
use zima_tools::{FileWorkspace, ToolHandler, ToolRegistry, register_builtin_tools};

mod builtin_hooks;
mod state;

pub use builtin_hooks::{CORE_PLUGIN, primary_path};
pub use state::StateReport;

pub struct ZimaCoreBuilder {
    workspace: PathBuf,
    config: Option<AppConfig>,
    sink: Option<Arc<dyn EventSink>>,
    approver: Arc<dyn Approver>,
    summarizer: Arc<dyn Summarizer>,
    builtin_tools: bool,
}

impl ZimaCoreBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn builtin_tools(mut self, enabled: bool) -> Self {
        self.builtin_tools = enabled;
        self
    }

    pub fn build(self) -> Result<Arc<ZimaCore>> {
        let config = match self.config {
            Some(config) => config,
            None => AppConfig::load(&self.workspace)?,
        };
        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(Observer::for_workspace(&self.workspace, &config)?),
        };
        let policy = Arc::new(
            PermissionEvaluator::new(self.approver, sink.clone())
                .with_ttl(std::time::Duration::from_secs(
                    config.permission.approval_ttl_seconds,
                ))
                .with_rules(config.permission.rules.clone()),
        );
        let agents = Arc::new(AgentCatalog::with_default(&config.session.default_agent));
        let tools = Arc::new(ToolRegistry::new(policy.clone(), sink.clone()));
        let sessions = Arc::new(SessionStore::new(
            agents.clone(),
            self.summarizer,
            sink.clone(),
        ));
        let files = Arc::new(FileWorkspace::from_config(
            &self.workspace,
            &config.storage,
        ));
        if self.builtin_tools {
            register_builtin_tools(&tools, files.clone());
        }

        let workspace = self.workspace;
        Ok(Arc::new_cyclic(|core: &Weak<ZimaCore>| {
            let hooks = Arc::new(HookBus::new(sink.clone()));
            builtin_hooks::install(&hooks, core.clone());
            ZimaCore {
                workspace,
                config,
                sink,
                policy,
                agents,
                tools,
                sessions,
                hooks,
                files,
            }
        }))
    }
}

pub struct ZimaCore {
    workspace: PathBuf,
    config: AppConfig,
    sink: Arc<dyn EventSink>,
    policy: Arc<PermissionEvaluator>,
    agents: Arc<AgentCatalog>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    hooks: Arc<HookBus>,
    files: Arc<FileWorkspace>,
}

impl ZimaCore {
    pub fn builder(workspace: &Path) -> ZimaCoreBuilder {
        ZimaCoreBuilder {
            workspace: workspace.to_path_buf(),
            config: None,
            sink: None,
            approver: Arc::new(AutoApprover),
            summarizer: Arc::new(DigestSummarizer),
            builtin_tools: true,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn policy(&self) -> &Arc<PermissionEvaluator> {
        &self.policy
    }

    pub fn agents(&self) -> &Arc<AgentCatalog> {
        &self.agents
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn files(&self) -> &Arc<FileWorkspace> {
        &self.files
    }

    pub fn register_tool(&self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        self.tools.register(definition, handler);
    }

    /// Tools advertised to clients. Inside a session the agent's own deny
    /// rules hide tools it may never call.
    pub fn visible_tools(&self, session_id: Option<Uuid>) -> Vec<ToolDefinition> {
        let visible = self.tools.list_visible();
        match session_id.and_then(|id| self.sessions.get(id)) {
            Some(session) => self.agents.tools_for(&session.agent, visible),
            None => visible,
        }
    }

    /// Run `PermissionRequest` hooks, then the policy. A hook Stop denies.
    pub async fn request_permission(
        &self,
        permission: &str,
        value: &str,
        session_id: Option<Uuid>,
    ) -> PermissionAction {
        let chain = self
            .hooks
            .execute(
                HookPoint::PermissionRequest,
                session_id,
                json!({"permission": permission, "value": value}),
            )
            .await;
        if !chain.proceed {
            return PermissionAction::Deny;
        }
        let request = PermissionRequest::new(permission, value).in_session(session_id);
        self.policy.request(&request).await
    }

    /// Before-hooks, registry, after-hooks. A Stop from a before-hook yields a
    /// `Blocked` result and the registry is never consulted.
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: Value,
        session_id: Option<Uuid>,
    ) -> ToolResult {
        let before = self
            .hooks
            .execute(
                HookPoint::BeforeToolExecute,
                session_id,
                json!({"tool": name, "arguments": arguments}),
            )
            .await;
        if !before.proceed {
            let reason = before
                .reason
                .unwrap_or_else(|| format!("blocked by plugin hook for tool '{name}'"));
            self.sink.publish(EventKind::ToolDeniedV1 {
                name: name.to_string(),
                session_id,
                reason: reason.clone(),
            });
            return ToolResult::blocked(name, reason);
        }
        let arguments = before
            .data
            .get("arguments")
            .cloned()
            .unwrap_or(arguments);

        // Checked under the same (tool, value) key as the permission gate.
        let target = primary_path(&arguments).unwrap_or("*").to_string();
        let result = self
            .tools
            .execute_scoped(name, arguments.clone(), session_id, &target)
            .await;

        let result_value = serde_json::to_value(&result).unwrap_or(Value::Null);
        self.hooks
            .execute(
                HookPoint::AfterToolExecute,
                session_id,
                json!({"tool": result.tool_name, "arguments": arguments, "result": result_value}),
            )
            .await;
        result
    }

    pub async fn create_session(&self, title: Option<&str>, agent: Option<&str>) -> Session {
        let session = self.sessions.create(title, agent);
        self.install_agent_rules(session.id, &session.agent);
        self.hooks
            .execute(
                HookPoint::SessionCreate,
                Some(session.id),
                json!({"session_id": session.id, "agent": session.agent, "title": session.title}),
            )
            .await;
        session
    }

    pub async fn fork_session(&self, id: Uuid, at: Option<usize>) -> Option<Session> {
        let fork = self.sessions.fork(id, at)?;
        self.install_agent_rules(fork.id, &fork.agent);
        for rule in self.policy.session_rules(id) {
            self.policy.add_session_rule(fork.id, rule);
        }
        self.hooks
            .execute(
                HookPoint::SessionFork,
                Some(fork.id),
                json!({"session_id": fork.id, "parent_id": id, "fork_point": fork.fork_point}),
            )
            .await;
        Some(fork)
    }

    pub fn delete_session(&self, id: Uuid) -> bool {
        let removed = self.sessions.delete(id);
        if removed {
            self.policy.clear_session(id);
        }
        removed
    }

    /// Append a message. `BeforeMessageSend` hooks may rewrite the content or
    /// stop it; `AfterMessageReceive` hooks see the stored message.
    pub async fn add_message(&self, session_id: Uuid, message: Message) -> Result<Message, ZimaError> {
        if !self.sessions.contains(session_id) {
            return Err(ZimaError::SessionNotFound(session_id));
        }
        let before = self
            .hooks
            .execute(
                HookPoint::BeforeMessageSend,
                Some(session_id),
                json!({"role": message.role, "content": message.content}),
            )
            .await;
        if !before.proceed {
            return Err(ZimaError::Blocked(
                before
                    .reason
                    .unwrap_or_else(|| "message blocked by plugin hook".to_string()),
            ));
        }
        let mut message = message;
        if let Some(content) = before.data.get("content").and_then(Value::as_str) {
            message.content = content.to_string();
        }

        let stored = self.sessions.add_message(session_id, message)?;
        let count = self.sessions.message_count(session_id).unwrap_or_default();
        self.hooks
            .execute(
                HookPoint::AfterMessageReceive,
                Some(session_id),
                json!({
                    "session_id": session_id,
                    "message_id": stored.id,
                    "role": stored.role,
                    "message_count": count,
                }),
            )
            .await;
        Ok(stored)
    }

    /// Rebind a session's agent. A `AgentSwitch` Stop vetoes the switch.
    pub async fn switch_agent(&self, session_id: Uuid, agent: &str) -> bool {
        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };
        if !self.agents.contains(agent) {
            return false;
        }
        let chain = self
            .hooks
            .execute(
                HookPoint::AgentSwitch,
                Some(session_id),
                json!({"session_id": session_id, "from": session.agent, "to": agent}),
            )
            .await;
        if !chain.proceed {
            tracing::info!(session = %session_id, agent, "agent switch vetoed by hook");
            return false;
        }
        if !self.sessions.switch_agent(session_id, agent) {
            return false;
        }
        self.install_agent_rules(session_id, agent);
        true
    }

    /// Compact a session, keeping `keep_recent` messages (the configured
    /// default when `None`). A `SessionCompact` Stop vetoes it.
    pub async fn compact_session(
        &self,
        session_id: Uuid,
        keep_recent: Option<usize>,
    ) -> Result<Option<CompactionRecord>, ZimaError> {
        let count = self
            .sessions
            .message_count(session_id)
            .ok_or(ZimaError::SessionNotFound(session_id))?;
        let keep = keep_recent.unwrap_or(self.config.session.auto_compact_keep_recent);
        let chain = self
            .hooks
            .execute(
                HookPoint::SessionCompact,
                Some(session_id),
                json!({"session_id": session_id, "message_count": count, "keep_recent": keep}),
            )
            .await;
        if !chain.proceed {
            tracing::info!(session = %session_id, "compaction vetoed by hook");
            return Ok(None);
        }
        self.sessions.compact(session_id, keep).await
    }

    fn install_agent_rules(&self, session_id: Uuid, agent: &str) {
        let rules = self
            .agents
            .get(agent)
            .map(|a| a.permissions)
            .unwrap_or_default();
        self.policy.set_agent_rules(session_id, rules);
    }
}
