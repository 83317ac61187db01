use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

mod config;

pub use config::{
    AppConfig, LogConfig, PermissionConfig, ServerConfig, SessionConfig, StorageConfig,
    merge_json_value,
};

pub type Result<T> = anyhow::Result<T>;

/// MCP protocol revision announced by `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_AGENT: &str = "build";
/// Sessions above this many messages are compacted after a message arrives.
pub const AUTO_COMPACT_THRESHOLD: usize = 50;
/// Messages kept verbatim by auto-compaction.
pub const AUTO_COMPACT_KEEP_RECENT: usize = 20;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".zima")
}

// ── Conversation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultRecord>,
    #[serde(default)]
    pub is_compaction_summary: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            is_compaction_summary: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// The synthetic message that stands in for a compacted prefix.
    pub fn compaction_summary(summary: impl Into<String>) -> Self {
        Self {
            is_compaction_summary: true,
            ..Self::system(summary)
        }
    }

    pub fn with_tool_call(mut self, call: ToolCallRecord) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_tool_result(mut self, result: ToolResultRecord) -> Self {
        self.tool_results.push(result);
        self
    }
}

/// Audit trail entry written once per compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub id: Uuid,
    pub messages_replaced: usize,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub title: String,
    pub agent: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub fork_point: Option<usize>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub compactions: Vec<CompactionRecord>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: impl Into<String>, agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            agent: agent.into(),
            parent_id: None,
            fork_point: None,
            messages: Vec::new(),
            compactions: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_fork(&self) -> bool {
        self.parent_id.is_some()
    }
}

// ── Permissions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

impl std::fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

impl std::str::FromStr for PermissionAction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "ask" => Ok(Self::Ask),
            other => Err(anyhow::anyhow!(
                "invalid permission action '{}' (expected allow|deny|ask)",
                other
            )),
        }
    }
}

/// `(permission pattern, value pattern, action)`. Patterns are case-insensitive
/// globs supporting `*` and `?`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub permission: String,
    #[serde(default = "match_all")]
    pub pattern: String,
    pub action: PermissionAction,
}

fn match_all() -> String {
    "*".to_string()
}

impl PermissionRule {
    pub fn new(
        permission: impl Into<String>,
        pattern: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
        }
    }

    pub fn allow(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Allow)
    }

    pub fn deny(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Deny)
    }

    pub fn ask(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Ask)
    }
}

// ── Agents ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub mode: AgentMode,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Upper bound on tool-use steps per turn.
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub model: Option<ModelRef>,
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing)]
    pub builtin: bool,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, mode: AgentMode) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            mode,
            color: None,
            temperature: None,
            top_p: None,
            max_steps: None,
            model: None,
            permissions: Vec::new(),
            prompt: String::new(),
            builtin: false,
        }
    }

    /// Substitute `{{key}}` placeholders in the prompt template.
    pub fn render_prompt(&self, vars: &BTreeMap<&str, String>) -> String {
        let mut out = self.prompt.clone();
        for (key, value) in vars {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }
}

// ── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: true,
            default: None,
            enum_values: Vec::new(),
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|v| v.to_string()).collect();
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: "general".to_string(),
            parameters: Vec::new(),
            enabled: true,
            hidden: false,
            deprecated: false,
            aliases: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn is_visible(&self) -> bool {
        self.enabled && !self.hidden
    }

    /// JSON Schema advertised as `inputSchema` in `tools/list`.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert("type".to_string(), json!(param.param_type.as_str()));
            if !param.description.is_empty() {
                prop.insert("description".to_string(), json!(param.description));
            }
            if let Some(default) = &param.default {
                prop.insert("default".to_string(), default.clone());
            }
            if !param.enum_values.is_empty() {
                prop.insert("enum".to_string(), json!(param.enum_values));
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(param.name.clone());
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// What a handler hands back: text for the caller plus any files it wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_files: Vec<String>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            created_files: Vec::new(),
        }
    }

    pub fn with_created_file(mut self, path: impl Into<String>) -> Self {
        self.created_files.push(path.into());
        self
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    NotFound,
    NoHandler,
    Disabled,
    InvalidArguments,
    PermissionDenied,
    /// A `BeforeToolExecute` hook stopped the call.
    Blocked,
    HandlerError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_files: Vec<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn succeeded(tool_name: impl Into<String>, output: ToolOutput, duration_ms: u64) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            output: output.text,
            error: None,
            failure: None,
            created_files: output.created_files,
            duration_ms,
        }
    }

    pub fn failed(
        tool_name: impl Into<String>,
        failure: ToolFailure,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            failure: Some(failure),
            created_files: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn blocked(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::failed(tool_name, ToolFailure::Blocked, reason)
    }

    pub fn is_blocked(&self) -> bool {
        self.failure == Some(ToolFailure::Blocked)
    }

    /// Text shown to an MCP client: the output on success, the error otherwise.
    pub fn display_text(&self) -> &str {
        if self.success {
            &self.output
        } else {
            self.error.as_deref().unwrap_or("tool failed")
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    ToolRegisteredV1 {
        name: String,
    },
    ToolUnregisteredV1 {
        name: String,
    },
    ToolExecutedV1 {
        name: String,
        session_id: Option<Uuid>,
        success: bool,
        duration_ms: u64,
    },
    ToolDeniedV1 {
        name: String,
        session_id: Option<Uuid>,
        reason: String,
    },
    PermissionEvaluatedV1 {
        permission: String,
        value: String,
        session_id: Option<Uuid>,
        action: PermissionAction,
    },
    PermissionApprovedV1 {
        permission: String,
        value: String,
        session_id: Option<Uuid>,
        action: PermissionAction,
        cached: bool,
    },
    SessionCreatedV1 {
        session_id: Uuid,
        agent: String,
    },
    SessionForkedV1 {
        session_id: Uuid,
        parent_id: Uuid,
        fork_point: usize,
    },
    SessionCompactedV1 {
        session_id: Uuid,
        messages_replaced: usize,
    },
    SessionDeletedV1 {
        session_id: Uuid,
    },
    MessageAddedV1 {
        session_id: Uuid,
        role: Role,
    },
    AgentSwitchedV1 {
        session_id: Uuid,
        from: String,
        to: String,
    },
    PluginRegisteredV1 {
        plugin: String,
    },
    PluginErrorV1 {
        plugin: String,
        hook: String,
        error: String,
    },
    FileCreatedV1 {
        path: String,
        tool_name: String,
        session_id: Option<Uuid>,
    },
    TransportStartedV1 {
        transport: String,
        endpoint: String,
    },
    TransportStoppedV1 {
        transport: String,
    },
}

impl EventKind {
    pub fn category(&self) -> &'static str {
        match self {
            Self::ToolRegisteredV1 { .. }
            | Self::ToolUnregisteredV1 { .. }
            | Self::ToolExecutedV1 { .. }
            | Self::ToolDeniedV1 { .. } => "tool",
            Self::PermissionEvaluatedV1 { .. } | Self::PermissionApprovedV1 { .. } => {
                "permission"
            }
            Self::SessionCreatedV1 { .. }
            | Self::SessionForkedV1 { .. }
            | Self::SessionCompactedV1 { .. }
            | Self::SessionDeletedV1 { .. }
            | Self::MessageAddedV1 { .. }
            | Self::AgentSwitchedV1 { .. } => "session",
            Self::PluginRegisteredV1 { .. } | Self::PluginErrorV1 { .. } => "plugin",
            Self::FileCreatedV1 { .. } => "file",
            Self::TransportStartedV1 { .. } | Self::TransportStoppedV1 { .. } => "transport",
        }
    }
}

/// Where subsystems publish what happened. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, kind: EventKind);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _kind: EventKind) {}
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ZimaError {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("blocked by hook: {0}")]
    Blocked(String),
}

impl ZimaError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_schema_lists_required_parameters() {
        let def = ToolDefinition::new("create_excel", "Create a workbook")
            .with_parameter(ToolParameter::required("file_path", ParamType::String))
            .with_parameter(
                ToolParameter::optional("sheet", ParamType::String)
                    .with_default(json!("Sheet1"))
                    .one_of(&["Sheet1", "Data"]),
            );
        let schema = def.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["file_path"]));
        assert_eq!(schema["properties"]["sheet"]["default"], "Sheet1");
        assert_eq!(schema["properties"]["sheet"]["enum"], json!(["Sheet1", "Data"]));
    }

    #[test]
    fn tool_definition_defaults_from_sparse_json() {
        let def: ToolDefinition =
            serde_json::from_str(r#"{"name":"merge_pdf","parameters":[{"name":"files","type":"array","required":true}]}"#)
                .expect("parse");
        assert!(def.enabled);
        assert!(!def.hidden);
        assert_eq!(def.parameters[0].param_type, ParamType::Array);
    }

    #[test]
    fn blocked_result_is_distinct_from_failure() {
        let blocked = ToolResult::blocked("delete_file", "permission denied");
        let failed = ToolResult::failed("delete_file", ToolFailure::HandlerError, "boom");
        assert!(blocked.is_blocked());
        assert!(!failed.is_blocked());
        assert_eq!(blocked.display_text(), "permission denied");
    }

    #[test]
    fn render_prompt_substitutes_placeholders() {
        let mut agent = AgentInfo::new("build", AgentMode::Primary);
        agent.prompt = "You have {{tool_count}} tools in {{workspace}}.".to_string();
        let mut vars = BTreeMap::new();
        vars.insert("tool_count", "12".to_string());
        vars.insert("workspace", "/srv".to_string());
        assert_eq!(agent.render_prompt(&vars), "You have 12 tools in /srv.");
    }

    #[test]
    fn permission_action_parses_case_insensitively() {
        assert_eq!("DENY".parse::<PermissionAction>().expect("deny"), PermissionAction::Deny);
        assert!("maybe".parse::<PermissionAction>().is_err());
    }

    #[test]
    fn permission_rule_pattern_defaults_to_match_all() {
        let rule: PermissionRule =
            serde_json::from_str(r#"{"permission":"delete_*","action":"deny"}"#).expect("rule");
        assert_eq!(rule.pattern, "*");
    }

    #[test]
    fn event_kinds_round_trip_via_serde() {
        let events = vec![
            EventKind::SessionForkedV1 {
                session_id: Uuid::now_v7(),
                parent_id: Uuid::now_v7(),
                fork_point: 3,
            },
            EventKind::ToolDeniedV1 {
                name: "delete_file".to_string(),
                session_id: None,
                reason: "rule".to_string(),
            },
            EventKind::PluginErrorV1 {
                plugin: "audit".to_string(),
                hook: "BeforeToolExecute".to_string(),
                error: "boom".to_string(),
            },
        ];
        for event in events {
            let serialized = serde_json::to_string(&event).expect("serialize");
            let deserialized: EventKind = serde_json::from_str(&serialized).expect("deserialize");
            assert_eq!(event, deserialized);
        }
    }

    #[test]
    fn compaction_summary_is_flagged_system_message() {
        let msg = Message::compaction_summary("digest");
        assert_eq!(msg.role, Role::System);
        assert!(msg.is_compaction_summary);
    }
}
