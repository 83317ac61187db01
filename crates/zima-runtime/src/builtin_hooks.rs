//! Hooks the core installs on its own bus under the `zima.core` plugin.

use serde_json::Value;
use std::sync::{Arc, Weak};
use zima_core::{EventKind, PermissionAction, ToolResult};
use zima_hooks::{HookBus, HookContext, HookOutcome, HookPoint, PluginInfo, hook_fn};

use crate::ZimaCore;

pub const CORE_PLUGIN: &str = "zima.core";

const GATE_PRIORITY: i32 = 1000;
const FILE_NOTIFY_PRIORITY: i32 = 0;
const AUTO_COMPACT_PRIORITY: i32 = -100;

const PATH_ARGUMENTS: [&str; 4] = ["file_path", "path", "output_path", "source_path"];

/// The path a tool call operates on, if its arguments name one.
pub fn primary_path(arguments: &Value) -> Option<&str> {
    PATH_ARGUMENTS
        .iter()
        .find_map(|key| arguments.get(*key).and_then(Value::as_str))
        .filter(|p| !p.is_empty())
}

pub(crate) fn install(bus: &HookBus, core: Weak<ZimaCore>) {
    let mut info = PluginInfo::new(CORE_PLUGIN);
    info.version = env!("CARGO_PKG_VERSION").to_string();
    info.description = "permission gate, file notifications, auto-compaction".to_string();
    bus.register_plugin(info);

    let gate = core.clone();
    bus.register_hook(
        CORE_PLUGIN,
        HookPoint::BeforeToolExecute,
        GATE_PRIORITY,
        hook_fn(move |ctx: HookContext| {
            let core = gate.clone();
            async move {
                let Some(core) = core.upgrade() else {
                    return Ok(HookOutcome::proceed());
                };
                permission_gate(&core, &ctx).await
            }
        }),
    );

    let notify = core.clone();
    bus.register_hook(
        CORE_PLUGIN,
        HookPoint::AfterToolExecute,
        FILE_NOTIFY_PRIORITY,
        hook_fn(move |ctx: HookContext| {
            let core = notify.upgrade();
            async move {
                if let Some(core) = core {
                    announce_created_files(&core, &ctx);
                }
                Ok(HookOutcome::proceed())
            }
        }),
    );

    bus.register_hook(
        CORE_PLUGIN,
        HookPoint::AfterMessageReceive,
        AUTO_COMPACT_PRIORITY,
        hook_fn(move |ctx: HookContext| {
            let core = core.clone();
            async move {
                let Some(core) = core.upgrade() else {
                    return Ok(HookOutcome::proceed());
                };
                auto_compact(core, &ctx).await;
                Ok(HookOutcome::proceed())
            }
        }),
    );
}

async fn permission_gate(core: &ZimaCore, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
    let Some(tool) = ctx.str_field("tool") else {
        return Ok(HookOutcome::proceed());
    };
    let value = ctx
        .data
        .get("arguments")
        .and_then(primary_path)
        .unwrap_or("*");
    match core.request_permission(tool, value, ctx.session_id).await {
        PermissionAction::Allow => Ok(HookOutcome::proceed()),
        _ => Ok(HookOutcome::stop(format!(
            "permission denied for tool '{tool}'"
        ))),
    }
}

fn announce_created_files(core: &ZimaCore, ctx: &HookContext) {
    let Some(result) = ctx
        .data
        .get("result")
        .cloned()
        .and_then(|v| serde_json::from_value::<ToolResult>(v).ok())
    else {
        return;
    };
    for path in &result.created_files {
        core.sink().publish(EventKind::FileCreatedV1 {
            path: path.clone(),
            tool_name: result.tool_name.clone(),
            session_id: ctx.session_id,
        });
    }
}

async fn auto_compact(core: Arc<ZimaCore>, ctx: &HookContext) {
    let settings = &core.config().session;
    if !settings.auto_compact {
        return;
    }
    let Some(session_id) = ctx.session_id else {
        return;
    };
    let count = ctx
        .data
        .get("message_count")
        .and_then(Value::as_u64)
        .unwrap_or_default() as usize;
    if count <= settings.auto_compact_threshold {
        return;
    }
    let keep = settings.auto_compact_keep_recent;
    match core.compact_session(session_id, Some(keep)).await {
        Ok(Some(record)) => {
            tracing::info!(
                session = %session_id,
                replaced = record.messages_replaced,
                "auto-compacted session"
            );
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(session = %session_id, error = %err, "auto-compaction failed"),
    }
}
