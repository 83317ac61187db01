//! Helpers shared by the integration tests of the other crates.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zima_core::{
    EventKind, EventSink, ParamType, ToolDefinition, ToolOutput, ToolParameter,
};
use zima_tools::ToolHandler;

/// Event sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EventKind>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EventKind> {
        self.events.lock().expect("recording sink lock").clone()
    }

    pub fn count_where(&self, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.events
            .lock()
            .expect("recording sink lock")
            .iter()
            .filter(|e| pred(e))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("recording sink lock").clear();
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, kind: EventKind) {
        self.events.lock().expect("recording sink lock").push(kind);
    }
}

/// Tool handler that records every call and echoes the arguments back.
/// Optionally reports a created file taken from the `file_path` argument.
#[derive(Default)]
pub struct SpyTool {
    calls: AtomicUsize,
    last_args: Mutex<Option<Value>>,
    reports_files: bool,
}

impl SpyTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn creating_files() -> Arc<Self> {
        Arc::new(Self {
            reports_files: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Option<Value> {
        self.last_args.lock().expect("spy lock").clone()
    }

    /// A definition with one optional `file_path` string parameter.
    pub fn definition(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, format!("spy tool {name}"))
            .with_category("test")
            .with_parameter(ToolParameter::optional("file_path", ParamType::String))
    }
}

#[async_trait]
impl ToolHandler for SpyTool {
    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_args.lock().expect("spy lock") = Some(arguments.clone());
        let mut output = ToolOutput::text(arguments.to_string());
        if self.reports_files
            && let Some(path) = arguments.get("file_path").and_then(Value::as_str)
        {
            output = output.with_created_file(path);
        }
        Ok(output)
    }
}

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempfile::tempdir()?)
}
