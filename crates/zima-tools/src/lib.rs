use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;
use zima_core::{
    EventKind, EventSink, PermissionAction, ToolDefinition, ToolFailure, ToolOutput, ToolResult,
};
use zima_policy::{PermissionEvaluator, PermissionRequest};

mod builtin;
mod validation;

pub use builtin::{
    FileLocation, FileWorkspace, builtin_definitions, next_version_path, register_builtin_tools,
};
pub use validation::validate_arguments;

/// Executes one tool call. Handlers are not persisted and must be attached
/// again after a restart.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<ToolOutput>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        (self.0)(arguments).await
    }
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct ToolEntry {
    definition: ToolDefinition,
    handler: Option<Arc<dyn ToolHandler>>,
}

pub struct ToolRegistry {
    tools: Mutex<BTreeMap<String, ToolEntry>>,
    policy: Arc<PermissionEvaluator>,
    sink: Arc<dyn EventSink>,
}

impl ToolRegistry {
    pub fn new(policy: Arc<PermissionEvaluator>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            tools: Mutex::new(BTreeMap::new()),
            policy,
            sink,
        }
    }

    /// Insert or replace the tool under `definition.name`.
    pub fn register(&self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        let name = definition.name.clone();
        self.tools.lock().expect("tool registry lock").insert(
            name.clone(),
            ToolEntry {
                definition,
                handler: Some(handler),
            },
        );
        self.sink.publish(EventKind::ToolRegisteredV1 { name });
    }

    /// Insert a definition without a handler. A handler already attached
    /// under the same name is kept.
    pub fn register_definition(&self, definition: ToolDefinition) {
        let name = definition.name.clone();
        {
            let mut tools = self.tools.lock().expect("tool registry lock");
            let handler = tools.remove(&name).and_then(|entry| entry.handler);
            tools.insert(
                name.clone(),
                ToolEntry {
                    definition,
                    handler,
                },
            );
        }
        self.sink.publish(EventKind::ToolRegisteredV1 { name });
    }

    pub fn attach_handler(&self, name: &str, handler: Arc<dyn ToolHandler>) -> bool {
        let mut tools = self.tools.lock().expect("tool registry lock");
        match resolve_key(&tools, name).and_then(|key| tools.get_mut(&key)) {
            Some(entry) => {
                entry.handler = Some(handler);
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut tools = self.tools.lock().expect("tool registry lock");
            resolve_key(&tools, name).and_then(|key| tools.remove(&key))
        };
        match removed {
            Some(entry) => {
                self.sink.publish(EventKind::ToolUnregisteredV1 {
                    name: entry.definition.name,
                });
                true
            }
            None => false,
        }
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut tools = self.tools.lock().expect("tool registry lock");
        match resolve_key(&tools, name).and_then(|key| tools.get_mut(&key)) {
            Some(entry) => {
                entry.definition.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Look up by name, then by alias.
    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        let tools = self.tools.lock().expect("tool registry lock");
        resolve_key(&tools, name)
            .and_then(|key| tools.get(&key))
            .map(|entry| entry.definition.clone())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        let tools = self.tools.lock().expect("tool registry lock");
        resolve_key(&tools, name)
            .and_then(|key| tools.get(&key))
            .is_some_and(|entry| entry.handler.is_some())
    }

    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools
            .lock()
            .expect("tool registry lock")
            .values()
            .map(|entry| entry.definition.clone())
            .collect()
    }

    /// Enabled, non-hidden tools: what `tools/list` advertises.
    pub fn list_visible(&self) -> Vec<ToolDefinition> {
        self.list().into_iter().filter(|d| d.is_visible()).collect()
    }

    pub fn list_by_category(&self, category: &str) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter(|d| d.category.eq_ignore_ascii_case(category))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tools.lock().expect("tool registry lock").len()
    }

    /// Run a tool. Every failure comes back as data in the [`ToolResult`].
    pub async fn execute(&self, name: &str, arguments: Value, session_id: Option<Uuid>) -> ToolResult {
        self.execute_scoped(name, arguments, session_id, "*").await
    }

    /// [`execute`](Self::execute) with the permission checked against
    /// `(tool, target)` instead of `(tool, "*")`, so path-scoped rules apply.
    pub async fn execute_scoped(
        &self,
        name: &str,
        arguments: Value,
        session_id: Option<Uuid>,
        target: &str,
    ) -> ToolResult {
        let looked_up = {
            let tools = self.tools.lock().expect("tool registry lock");
            resolve_key(&tools, name)
                .and_then(|key| tools.get(&key))
                .map(|entry| (entry.definition.clone(), entry.handler.clone()))
        };
        let Some((definition, handler)) = looked_up else {
            return self.finish(
                session_id,
                ToolResult::failed(name, ToolFailure::NotFound, format!("tool not found: {name}")),
            );
        };
        let tool_name = definition.name.clone();
        let Some(handler) = handler else {
            return self.finish(
                session_id,
                ToolResult::failed(
                    &tool_name,
                    ToolFailure::NoHandler,
                    format!("no handler registered for tool: {tool_name}"),
                ),
            );
        };
        if !definition.enabled {
            return self.finish(
                session_id,
                ToolResult::failed(
                    &tool_name,
                    ToolFailure::Disabled,
                    format!("tool is disabled: {tool_name}"),
                ),
            );
        }

        let request = PermissionRequest::new(&tool_name, target).in_session(session_id);
        if self.policy.request(&request).await == PermissionAction::Deny {
            let reason = format!("permission denied for tool '{tool_name}'");
            self.sink.publish(EventKind::ToolDeniedV1 {
                name: tool_name.clone(),
                session_id,
                reason: reason.clone(),
            });
            return self.finish(
                session_id,
                ToolResult::failed(&tool_name, ToolFailure::PermissionDenied, reason),
            );
        }

        let arguments = match validate_arguments(&definition, arguments) {
            Ok(arguments) => arguments,
            Err(message) => {
                return self.finish(
                    session_id,
                    ToolResult::failed(&tool_name, ToolFailure::InvalidArguments, message),
                );
            }
        };

        let started = Instant::now();
        let outcome = tokio::spawn(async move { handler.call(arguments).await }).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(Ok(output)) => ToolResult::succeeded(&tool_name, output, duration_ms),
            Ok(Err(err)) => ToolResult {
                duration_ms,
                ..ToolResult::failed(&tool_name, ToolFailure::HandlerError, format!("{err:#}"))
            },
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "tool task was cancelled".to_string()
                };
                tracing::error!(tool = %tool_name, error = %message, "tool handler panicked");
                ToolResult {
                    duration_ms,
                    ..ToolResult::failed(
                        &tool_name,
                        ToolFailure::HandlerError,
                        format!("tool handler panicked: {message}"),
                    )
                }
            }
        };
        self.finish(session_id, result)
    }

    fn finish(&self, session_id: Option<Uuid>, result: ToolResult) -> ToolResult {
        tracing::debug!(
            tool = %result.tool_name,
            success = result.success,
            duration_ms = result.duration_ms,
            "tool executed"
        );
        self.sink.publish(EventKind::ToolExecutedV1 {
            name: result.tool_name.clone(),
            session_id,
            success: result.success,
            duration_ms: result.duration_ms,
        });
        result
    }

    /// Load every `*.json` file in `dir`; each holds one definition or an
    /// array of them. Malformed files are skipped. Returns how many
    /// definitions were registered.
    pub fn load_from_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match read_definitions(&path) {
                Ok(definitions) => {
                    for definition in definitions {
                        self.register_definition(definition);
                        loaded += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping tool definition file");
                }
            }
        }
        Ok(loaded)
    }

    /// Write one `<name>.json` per definition. Returns how many were written.
    pub fn save_to_dir(&self, dir: &Path) -> Result<usize> {
        fs::create_dir_all(dir)?;
        let definitions = self.list();
        for definition in &definitions {
            fs::write(
                dir.join(format!("{}.json", definition.name)),
                serde_json::to_vec_pretty(definition)?,
            )?;
        }
        Ok(definitions.len())
    }
}

fn resolve_key(tools: &BTreeMap<String, ToolEntry>, name: &str) -> Option<String> {
    if tools.contains_key(name) {
        return Some(name.to_string());
    }
    tools
        .values()
        .find(|entry| entry.definition.aliases.iter().any(|alias| alias == name))
        .map(|entry| entry.definition.name.clone())
}

fn read_definitions(path: &Path) -> Result<Vec<ToolDefinition>> {
    let raw = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;
    Ok(match value {
        Value::Array(_) => serde_json::from_value(value)?,
        _ => vec![serde_json::from_value(value)?],
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
