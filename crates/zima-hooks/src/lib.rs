use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use zima_core::{EventKind, EventSink};

// ── Hook Points ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    /// Before a tool runs. May rewrite the arguments or stop the call.
    BeforeToolExecute,
    /// After a tool returns, with the result in `data`.
    AfterToolExecute,
    BeforeMessageSend,
    /// After a message is appended to a session.
    AfterMessageReceive,
    SessionCreate,
    SessionFork,
    /// Before compaction. Stop vetoes it.
    SessionCompact,
    /// Before an agent switch. Stop vetoes it.
    AgentSwitch,
    PermissionRequest,
}

impl HookPoint {
    pub const ALL: [HookPoint; 9] = [
        Self::BeforeToolExecute,
        Self::AfterToolExecute,
        Self::BeforeMessageSend,
        Self::AfterMessageReceive,
        Self::SessionCreate,
        Self::SessionFork,
        Self::SessionCompact,
        Self::AgentSwitch,
        Self::PermissionRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeToolExecute => "BeforeToolExecute",
            Self::AfterToolExecute => "AfterToolExecute",
            Self::BeforeMessageSend => "BeforeMessageSend",
            Self::AfterMessageReceive => "AfterMessageReceive",
            Self::SessionCreate => "SessionCreate",
            Self::SessionFork => "SessionFork",
            Self::SessionCompact => "SessionCompact",
            Self::AgentSwitch => "AgentSwitch",
            Self::PermissionRequest => "PermissionRequest",
        }
    }

    /// Accepts the PascalCase name or its lowercase/snake_case spelling.
    pub fn parse(s: &str) -> Option<Self> {
        let key: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|point| point.as_str().to_ascii_lowercase() == key)
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Context and Outcome ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookControl {
    /// Run the next hook.
    #[default]
    Continue,
    /// Skip remaining hooks; the caller still proceeds.
    Skip,
    /// Skip remaining hooks and tell the caller not to proceed.
    Stop,
}

/// What a hook sees. Handlers get a shared view; a new payload only takes
/// effect when returned in [`HookOutcome::data`].
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    pub point: HookPoint,
    pub session_id: Option<Uuid>,
    pub data: Value,
}

impl HookContext {
    pub fn new(point: HookPoint, session_id: Option<Uuid>, data: Value) -> Self {
        Self {
            point,
            session_id,
            data,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutcome {
    pub control: HookControl,
    pub data: Option<Value>,
    pub reason: Option<String>,
}

impl HookOutcome {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn skip() -> Self {
        Self {
            control: HookControl::Skip,
            ..Self::default()
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            control: HookControl::Stop,
            reason: Some(reason.into()),
            data: None,
        }
    }
}

/// Result of running every hook registered at a point.
#[derive(Debug, Clone, PartialEq)]
pub struct HookChainResult {
    pub proceed: bool,
    pub data: Value,
    /// Plugin whose hook stopped or skipped the chain.
    pub stopped_by: Option<String>,
    pub reason: Option<String>,
    pub runs: usize,
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &HookContext) -> Result<HookOutcome>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> HookHandler for FnHook<F>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
{
    async fn handle(&self, ctx: &HookContext) -> Result<HookOutcome> {
        (self.0)(ctx.clone()).await
    }
}

pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
{
    Arc::new(FnHook(f))
}

// ── Plugins ──────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

impl PluginInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            description: String::new(),
            enabled: true,
            config: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookSummary {
    pub id: Uuid,
    pub plugin: String,
    pub point: HookPoint,
    pub priority: i32,
}

struct HookRegistration {
    id: Uuid,
    plugin: String,
    point: HookPoint,
    priority: i32,
    seq: u64,
    handler: Arc<dyn HookHandler>,
}

#[derive(Default)]
struct BusState {
    hooks: Vec<HookRegistration>,
    plugins: BTreeMap<String, PluginInfo>,
    next_seq: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PluginsFile {
    #[serde(default)]
    plugins: Vec<PluginInfo>,
}

// ── Hook Bus ─────────────────────────────────────────────────────────────────

pub struct HookBus {
    state: Mutex<BusState>,
    sink: Arc<dyn EventSink>,
}

impl HookBus {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            sink,
        }
    }

    /// Add or replace plugin metadata. Hooks already registered by the plugin
    /// are kept.
    pub fn register_plugin(&self, info: PluginInfo) {
        let name = info.name.clone();
        self.state
            .lock()
            .expect("hook bus lock")
            .plugins
            .insert(name.clone(), info);
        self.sink
            .publish(EventKind::PluginRegisteredV1 { plugin: name });
    }

    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut state = self.state.lock().expect("hook bus lock");
        match state.plugins.get_mut(name) {
            Some(info) => {
                info.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.state
            .lock()
            .expect("hook bus lock")
            .plugins
            .values()
            .cloned()
            .collect()
    }

    /// Register a handler. Hooks run by descending priority, ties in
    /// registration order. An unknown plugin is registered enabled.
    pub fn register_hook(
        &self,
        plugin: &str,
        point: HookPoint,
        priority: i32,
        handler: Arc<dyn HookHandler>,
    ) -> Uuid {
        let id = Uuid::now_v7();
        let new_plugin = {
            let mut state = self.state.lock().expect("hook bus lock");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.hooks.push(HookRegistration {
                id,
                plugin: plugin.to_string(),
                point,
                priority,
                seq,
                handler,
            });
            state
                .hooks
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            if state.plugins.contains_key(plugin) {
                false
            } else {
                state
                    .plugins
                    .insert(plugin.to_string(), PluginInfo::new(plugin));
                true
            }
        };
        if new_plugin {
            self.sink.publish(EventKind::PluginRegisteredV1 {
                plugin: plugin.to_string(),
            });
        }
        id
    }

    pub fn unregister_hook(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().expect("hook bus lock");
        let before = state.hooks.len();
        state.hooks.retain(|h| h.id != id);
        state.hooks.len() != before
    }

    /// Drop a plugin and every hook it owns. Returns the number of hooks removed.
    pub fn unregister_plugin(&self, name: &str) -> usize {
        let mut state = self.state.lock().expect("hook bus lock");
        state.plugins.remove(name);
        let before = state.hooks.len();
        state.hooks.retain(|h| h.plugin != name);
        before - state.hooks.len()
    }

    /// Registered hooks at `point`, in execution order.
    pub fn hooks(&self, point: HookPoint) -> Vec<HookSummary> {
        self.state
            .lock()
            .expect("hook bus lock")
            .hooks
            .iter()
            .filter(|h| h.point == point)
            .map(|h| HookSummary {
                id: h.id,
                plugin: h.plugin.clone(),
                point: h.point,
                priority: h.priority,
            })
            .collect()
    }

    /// Run the chain for `point`, threading `data` through each hook. A hook
    /// that fails or panics is reported and treated as Continue.
    pub async fn execute(
        &self,
        point: HookPoint,
        session_id: Option<Uuid>,
        data: Value,
    ) -> HookChainResult {
        let chain: Vec<(String, Arc<dyn HookHandler>)> = {
            let state = self.state.lock().expect("hook bus lock");
            state
                .hooks
                .iter()
                .filter(|h| h.point == point)
                .filter(|h| state.plugins.get(&h.plugin).is_none_or(|p| p.enabled))
                .map(|h| (h.plugin.clone(), h.handler.clone()))
                .collect()
        };

        let mut ctx = HookContext::new(point, session_id, data);
        let mut result = HookChainResult {
            proceed: true,
            data: Value::Null,
            stopped_by: None,
            reason: None,
            runs: 0,
        };

        for (plugin, handler) in chain {
            result.runs += 1;
            let task_ctx = ctx.clone();
            let joined = tokio::spawn(async move { handler.handle(&task_ctx).await }).await;
            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    self.report_failure(&plugin, point, format!("{err:#}"));
                    continue;
                }
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        "hook panicked".to_string()
                    } else {
                        "hook task was cancelled".to_string()
                    };
                    self.report_failure(&plugin, point, message);
                    continue;
                }
            };

            if let Some(data) = outcome.data {
                ctx.data = data;
            }
            match outcome.control {
                HookControl::Continue => {}
                HookControl::Skip => {
                    result.stopped_by = Some(plugin);
                    result.reason = outcome.reason;
                    break;
                }
                HookControl::Stop => {
                    tracing::debug!(plugin = %plugin, point = %point, "hook stopped chain");
                    result.proceed = false;
                    result.stopped_by = Some(plugin);
                    result.reason = outcome.reason;
                    break;
                }
            }
        }
        result.data = ctx.data;
        result
    }

    fn report_failure(&self, plugin: &str, point: HookPoint, error: String) {
        tracing::warn!(plugin = %plugin, point = %point, error = %error, "hook failed");
        self.sink.publish(EventKind::PluginErrorV1 {
            plugin: plugin.to_string(),
            hook: point.as_str().to_string(),
            error,
        });
    }

    /// Merge plugin metadata from a JSON file (`{ "plugins": [...] }` or a bare
    /// array). Absent file loads nothing.
    pub fn load_plugins(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)?;
        let plugins: Vec<PluginInfo> = match value {
            Value::Array(_) => serde_json::from_value(value)?,
            _ => serde_json::from_value::<PluginsFile>(value)?.plugins,
        };
        let count = plugins.len();
        let mut state = self.state.lock().expect("hook bus lock");
        for plugin in plugins {
            state.plugins.insert(plugin.name.clone(), plugin);
        }
        Ok(count)
    }

    pub fn save_plugins(&self, path: &Path) -> Result<()> {
        let file = PluginsFile {
            plugins: self.plugins(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recording(Mutex<Vec<EventKind>>);

    impl EventSink for Recording {
        fn publish(&self, kind: EventKind) {
            self.0.lock().expect("events lock").push(kind);
        }
    }

    /// Appends `tag` to `data.trail` and returns `control`.
    fn tagger(tag: &'static str, control: HookControl) -> Arc<dyn HookHandler> {
        hook_fn(move |ctx: HookContext| async move {
            let mut data = ctx.data.clone();
            let trail = data["trail"].as_str().unwrap_or("").to_string();
            data["trail"] = json!(format!("{trail}{tag}"));
            Ok(HookOutcome {
                control,
                data: Some(data),
                reason: Some(format!("by {tag}")),
            })
        })
    }

    fn bus() -> HookBus {
        HookBus::new(Arc::new(zima_core::NullSink))
    }

    #[test]
    fn hook_point_names_round_trip() {
        for point in HookPoint::ALL {
            assert_eq!(HookPoint::parse(point.as_str()), Some(point));
        }
        assert_eq!(
            HookPoint::parse("before_tool_execute"),
            Some(HookPoint::BeforeToolExecute)
        );
        assert_eq!(HookPoint::parse("nope"), None);
    }

    #[tokio::test]
    async fn hooks_run_by_priority_then_registration_order() {
        let bus = bus();
        bus.register_hook("p", HookPoint::SessionCreate, 0, tagger("c", HookControl::Continue));
        bus.register_hook("p", HookPoint::SessionCreate, 10, tagger("a", HookControl::Continue));
        bus.register_hook("p", HookPoint::SessionCreate, 0, tagger("d", HookControl::Continue));
        bus.register_hook("p", HookPoint::SessionCreate, 5, tagger("b", HookControl::Continue));

        let result = bus
            .execute(HookPoint::SessionCreate, None, json!({}))
            .await;
        assert!(result.proceed);
        assert_eq!(result.data["trail"], "abcd");
        assert_eq!(result.runs, 4);
    }

    #[tokio::test]
    async fn skip_ends_chain_but_proceeds() {
        let bus = bus();
        bus.register_hook("first", HookPoint::AgentSwitch, 2, tagger("a", HookControl::Skip));
        bus.register_hook("second", HookPoint::AgentSwitch, 1, tagger("b", HookControl::Continue));
        let result = bus.execute(HookPoint::AgentSwitch, None, json!({})).await;
        assert!(result.proceed);
        assert_eq!(result.data["trail"], "a");
        assert_eq!(result.stopped_by.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn stop_short_circuits_and_vetoes() {
        let bus = bus();
        bus.register_hook("gate", HookPoint::BeforeToolExecute, 100, tagger("x", HookControl::Stop));
        bus.register_hook("late", HookPoint::BeforeToolExecute, 0, tagger("y", HookControl::Continue));
        let result = bus
            .execute(HookPoint::BeforeToolExecute, None, json!({}))
            .await;
        assert!(!result.proceed);
        assert_eq!(result.runs, 1);
        assert_eq!(result.data["trail"], "x");
        assert_eq!(result.reason.as_deref(), Some("by x"));
    }

    #[tokio::test]
    async fn failing_and_panicking_hooks_are_reported_and_ignored() {
        let sink = Arc::new(Recording::default());
        let bus = HookBus::new(sink.clone());
        bus.register_hook(
            "broken",
            HookPoint::SessionFork,
            3,
            hook_fn(|_ctx: HookContext| async move {
                Err::<HookOutcome, _>(anyhow::anyhow!("bad config"))
            }),
        );
        bus.register_hook(
            "crashy",
            HookPoint::SessionFork,
            2,
            hook_fn(|ctx: HookContext| async move {
                if ctx.session_id.is_none() {
                    panic!("no session");
                }
                Ok(HookOutcome::proceed())
            }),
        );
        bus.register_hook("ok", HookPoint::SessionFork, 1, tagger("z", HookControl::Continue));

        let result = bus
            .execute(HookPoint::SessionFork, None, json!({"trail": ""}))
            .await;
        assert!(result.proceed);
        assert_eq!(result.data["trail"], "z");

        let errors: Vec<String> = sink
            .0
            .lock()
            .expect("events lock")
            .iter()
            .filter_map(|e| match e {
                EventKind::PluginErrorV1 { plugin, .. } => Some(plugin.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["broken", "crashy"]);
    }

    #[tokio::test]
    async fn disabled_plugins_are_skipped() {
        let bus = bus();
        bus.register_hook("audit", HookPoint::SessionCompact, 0, tagger("a", HookControl::Stop));
        assert!(bus.set_plugin_enabled("audit", false));
        let result = bus
            .execute(HookPoint::SessionCompact, None, json!({"trail": ""}))
            .await;
        assert!(result.proceed);
        assert_eq!(result.runs, 0);
    }

    #[tokio::test]
    async fn unregister_removes_hooks() {
        let bus = bus();
        let id = bus.register_hook("a", HookPoint::SessionCreate, 0, tagger("a", HookControl::Stop));
        bus.register_hook("b", HookPoint::SessionCreate, 0, tagger("b", HookControl::Stop));
        bus.register_hook("b", HookPoint::SessionFork, 0, tagger("b", HookControl::Stop));
        assert!(bus.unregister_hook(id));
        assert!(!bus.unregister_hook(id));
        assert_eq!(bus.unregister_plugin("b"), 2);
        assert!(bus.hooks(HookPoint::SessionCreate).is_empty());
        assert!(
            bus.execute(HookPoint::SessionCreate, None, json!({}))
                .await
                .proceed
        );
    }

    #[test]
    fn plugins_round_trip_and_keep_enabled_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plugins.json");
        let bus = bus();
        let mut audit = PluginInfo::new("audit");
        audit.version = "1.2.0".to_string();
        audit.config = json!({"level": "full"});
        bus.register_plugin(audit);
        bus.register_plugin(PluginInfo::new("quiet"));
        bus.set_plugin_enabled("quiet", false);
        bus.save_plugins(&path).expect("save");

        let restored = self::bus();
        assert_eq!(restored.load_plugins(&path).expect("load"), 2);
        assert_eq!(restored.plugins(), bus.plugins());
        assert_eq!(
            restored
                .load_plugins(&dir.path().join("absent.json"))
                .expect("absent"),
            0
        );
    }
}
