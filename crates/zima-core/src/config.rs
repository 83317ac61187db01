use crate::{
    AUTO_COMPACT_KEEP_RECENT, AUTO_COMPACT_THRESHOLD, DEFAULT_AGENT, PermissionRule, Result,
    runtime_dir,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub permission: PermissionConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub bind: String,
    pub http_port: u16,
    pub http_path: String,
    pub sse_port: u16,
    /// Prefix for the `/sse` and `/message` endpoints.
    pub sse_path: String,
    pub heartbeat_seconds: u64,
    pub stop_timeout_ms: u64,
    /// Requests (open SSE streams included) served at once per listener;
    /// beyond that clients get 503.
    pub max_in_flight: usize,
    /// Frames queued per SSE client before it is dropped as lagging.
    pub sse_client_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "zima-file-service".to_string(),
            bind: "127.0.0.1".to_string(),
            http_port: 5100,
            http_path: "/mcp".to_string(),
            sse_port: 5101,
            sse_path: String::new(),
            heartbeat_seconds: 30,
            stop_timeout_ms: 1_000,
            max_in_flight: 64,
            sse_client_queue: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_agent: String,
    pub auto_compact: bool,
    pub auto_compact_threshold: usize,
    pub auto_compact_keep_recent: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_agent: DEFAULT_AGENT.to_string(),
            auto_compact: true,
            auto_compact_threshold: AUTO_COMPACT_THRESHOLD,
            auto_compact_keep_recent: AUTO_COMPACT_KEEP_RECENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub approval_ttl_seconds: u64,
    /// Global rules installed before any persisted rules are loaded.
    pub rules: Vec<PermissionRule>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            approval_ttl_seconds: 3_600,
            rules: Vec::new(),
        }
    }
}

/// Workspace-relative locations of persisted state. Absolute paths are used as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub agents_file: String,
    pub permissions_file: String,
    pub plugins_file: String,
    pub sessions_file: String,
    pub tools_dir: String,
    pub generated_dir: String,
    pub uploaded_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            agents_file: ".zima/agents.json".to_string(),
            permissions_file: ".zima/permissions.json".to_string(),
            plugins_file: ".zima/plugins.json".to_string(),
            sessions_file: ".zima/sessions.json".to_string(),
            tools_dir: ".zima/tools".to_string(),
            generated_dir: "generated_files".to_string(),
            uploaded_dir: "uploaded_files".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn resolve(workspace: &Path, configured: &str) -> PathBuf {
        let path = Path::new(configured);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace.join(path)
        }
    }

    pub fn agents_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.agents_file)
    }

    pub fn permissions_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.permissions_file)
    }

    pub fn plugins_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.plugins_file)
    }

    pub fn sessions_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.sessions_file)
    }

    pub fn tools_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.tools_dir)
    }

    pub fn generated_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.generated_dir)
    }

    pub fn uploaded_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.uploaded_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub level: String,
    /// JSONL event log, workspace-relative. Empty disables it.
    pub file: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: ".zima/observe.log".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".zima/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid settings {}: {e}", path.display()))?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn log_path(&self, workspace: &Path) -> Option<PathBuf> {
        if self.log.file.trim().is_empty() {
            None
        } else {
            Some(StorageConfig::resolve(workspace, &self.log.file))
        }
    }
}

/// Deep merge: objects merge key by key, anything else is replaced by the overlay.
pub fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn project_settings_override_defaults_per_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(runtime_dir(dir.path())).expect("mkdir");
        fs::write(
            AppConfig::project_settings_path(dir.path()),
            r#"{"server":{"http_port":6200},"session":{"auto_compact_threshold":10}}"#,
        )
        .expect("write");

        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.server.http_port, 6200);
        assert_eq!(cfg.server.http_path, "/mcp");
        assert_eq!(cfg.session.auto_compact_threshold, 10);
        assert_eq!(cfg.session.auto_compact_keep_recent, AUTO_COMPACT_KEEP_RECENT);
    }

    #[test]
    fn local_settings_win_over_project_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(runtime_dir(dir.path())).expect("mkdir");
        fs::write(
            AppConfig::project_settings_path(dir.path()),
            r#"{"log":{"level":"debug"}}"#,
        )
        .expect("write");
        fs::write(
            AppConfig::project_local_settings_path(dir.path()),
            r#"{"log":{"level":"trace"}}"#,
        )
        .expect("write");

        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.log.level, "trace");
    }

    #[test]
    fn legacy_toml_is_read_as_lowest_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(runtime_dir(dir.path())).expect("mkdir");
        fs::write(
            AppConfig::legacy_toml_path(dir.path()),
            "[permission]\napproval_ttl_seconds = 60\n",
        )
        .expect("write");

        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.permission.approval_ttl_seconds, 60);
    }

    #[test]
    fn storage_paths_resolve_against_workspace() {
        let storage = StorageConfig {
            tools_dir: "/opt/tools".to_string(),
            ..StorageConfig::default()
        };
        let ws = Path::new("/srv/zima");
        assert_eq!(storage.tools_path(ws), PathBuf::from("/opt/tools"));
        assert_eq!(
            storage.sessions_path(ws),
            PathBuf::from("/srv/zima/.zima/sessions.json")
        );
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = AppConfig::default();
        cfg.server.sse_path = "/events".to_string();
        cfg.log.json = true;
        cfg.save(dir.path()).expect("save");
        let loaded = AppConfig::load(dir.path()).expect("load");
        assert_eq!(loaded.server.sse_path, "/events");
        assert!(loaded.log.json);
    }

    proptest! {
        #[test]
        fn merge_json_value_is_idempotent_for_flat_objects(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut base_value = json!(base);
            let overlay_value = json!(overlay);
            merge_json_value(&mut base_value, &overlay_value);
            let once = base_value.clone();
            merge_json_value(&mut base_value, &overlay_value);
            prop_assert_eq!(base_value, once);
        }

        #[test]
        fn overlay_keys_always_win(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut merged = json!(base);
            merge_json_value(&mut merged, &json!(overlay));
            for (key, value) in &overlay {
                prop_assert_eq!(&merged[key], &json!(value));
            }
        }
    }
}
