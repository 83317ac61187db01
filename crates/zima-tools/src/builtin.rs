//! Plain-file tools that operate inside the service's generated and
//! uploaded file directories.

use crate::{ToolHandler, ToolRegistry, handler_fn};
use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use zima_core::{ParamType, StorageConfig, ToolDefinition, ToolOutput, ToolParameter};
use zima_policy::wildcard_match;

const READ_MAX_BYTES_DEFAULT: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLocation {
    Generated,
    Uploaded,
}

impl FileLocation {
    fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.unwrap_or("generated") {
            "generated" => Ok(Self::Generated),
            "uploaded" => Ok(Self::Uploaded),
            other => bail!("unknown location '{other}' (expected generated|uploaded)"),
        }
    }
}

/// The directories file tools may touch. Relative paths only; anything that
/// would escape its directory is rejected.
#[derive(Debug, Clone)]
pub struct FileWorkspace {
    root: PathBuf,
    generated: PathBuf,
    uploaded: PathBuf,
}

impl FileWorkspace {
    pub fn new(root: &Path, generated: PathBuf, uploaded: PathBuf) -> Self {
        Self {
            root: root.to_path_buf(),
            generated,
            uploaded,
        }
    }

    pub fn from_config(workspace: &Path, storage: &StorageConfig) -> Self {
        Self::new(
            workspace,
            storage.generated_path(workspace),
            storage.uploaded_path(workspace),
        )
    }

    pub fn dir(&self, location: FileLocation) -> &Path {
        match location {
            FileLocation::Generated => &self.generated,
            FileLocation::Uploaded => &self.uploaded,
        }
    }

    pub fn resolve(&self, location: FileLocation, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        if relative.trim().is_empty() {
            bail!("file path is empty");
        }
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("path escapes the file workspace: {relative}");
        }
        Ok(self.dir(location).join(rel))
    }

    /// Path as reported to clients: relative to the workspace root when
    /// possible.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Resolve for reading: generated files first, then uploads.
    fn resolve_existing(&self, relative: &str) -> Result<PathBuf> {
        let generated = self.resolve(FileLocation::Generated, relative)?;
        if generated.exists() {
            return Ok(generated);
        }
        let uploaded = self.resolve(FileLocation::Uploaded, relative)?;
        if uploaded.exists() {
            return Ok(uploaded);
        }
        bail!("file not found: {relative}")
    }
}

/// `report.txt` -> `report_v2.txt`, or the next free `_vN` after that. An
/// existing `_vN` suffix on the input is replaced rather than stacked.
pub fn next_version_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let base = match stem.rsplit_once("_v") {
        Some((head, tail)) if !head.is_empty() && tail.parse::<u32>().is_ok() => head.to_string(),
        _ => stem,
    };
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let mut n: u32 = 2;
    loop {
        let candidate = parent.join(format!("{base}_v{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{key} missing"))
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

pub fn builtin_definitions() -> Vec<ToolDefinition> {
    let file_path = || {
        ToolParameter::required("file_path", ParamType::String)
            .describe("Path relative to the generated files directory")
    };
    vec![
        ToolDefinition::new("list_files", "List files in the generated or uploaded directory")
            .with_category("file")
            .with_parameter(
                ToolParameter::optional("location", ParamType::String)
                    .with_default(Value::from("generated"))
                    .one_of(&["generated", "uploaded"]),
            )
            .with_parameter(
                ToolParameter::optional("pattern", ParamType::String)
                    .describe("Glob filter on file names")
                    .with_default(Value::from("*")),
            ),
        ToolDefinition::new("read_text_file", "Read a UTF-8 text file")
            .with_category("file")
            .with_parameter(file_path())
            .with_parameter(ToolParameter::optional("max_bytes", ParamType::Integer)),
        ToolDefinition::new("write_text_file", "Write a UTF-8 text file, replacing any existing one")
            .with_category("file")
            .with_alias("create_text_file")
            .with_parameter(file_path())
            .with_parameter(ToolParameter::required("content", ParamType::String)),
        ToolDefinition::new(
            "create_new_version",
            "Write content to the next free versioned name (name_v2.ext, name_v3.ext, ...)",
        )
        .with_category("file")
        .with_parameter(file_path())
        .with_parameter(ToolParameter::required("content", ParamType::String)),
        ToolDefinition::new("create_json_file", "Write a JSON document")
            .with_category("file")
            .with_parameter(file_path())
            .with_parameter(ToolParameter::required("data", ParamType::Object)),
        ToolDefinition::new("merge_text_files", "Concatenate text files into a new file")
            .with_category("file")
            .with_parameter(ToolParameter::required("file_paths", ParamType::Array))
            .with_parameter(ToolParameter::required("output_path", ParamType::String))
            .with_parameter(
                ToolParameter::optional("separator", ParamType::String)
                    .with_default(Value::from("\n")),
            ),
        ToolDefinition::new("delete_file", "Delete a generated file")
            .with_category("file")
            .with_parameter(file_path()),
    ]
}

fn bind<F, Fut>(ws: &Arc<FileWorkspace>, f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Arc<FileWorkspace>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    let ws = ws.clone();
    handler_fn(move |args| f(ws.clone(), args))
}

/// Register every builtin file tool against `workspace`.
pub fn register_builtin_tools(registry: &ToolRegistry, workspace: Arc<FileWorkspace>) {
    for definition in builtin_definitions() {
        let handler = match definition.name.as_str() {
            "list_files" => bind(&workspace, list_files),
            "read_text_file" => bind(&workspace, read_text_file),
            "write_text_file" => bind(&workspace, write_text_file),
            "create_new_version" => bind(&workspace, create_new_version),
            "create_json_file" => bind(&workspace, create_json_file),
            "merge_text_files" => bind(&workspace, merge_text_files),
            "delete_file" => bind(&workspace, delete_file),
            _ => continue,
        };
        registry.register(definition, handler);
    }
}

async fn list_files(ws: Arc<FileWorkspace>, args: Value) -> Result<ToolOutput> {
    let location = FileLocation::parse(args.get("location").and_then(Value::as_str))?;
    let pattern = args.get("pattern").and_then(Value::as_str).unwrap_or("*");
    let dir = ws.dir(location);
    if !dir.is_dir() {
        return Ok(ToolOutput::text(""));
    }
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if wildcard_match(pattern, &name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(ToolOutput::text(names.join("\n")))
}

async fn read_text_file(ws: Arc<FileWorkspace>, args: Value) -> Result<ToolOutput> {
    let path = ws.resolve_existing(str_arg(&args, "file_path")?)?;
    let max_bytes = args
        .get("max_bytes")
        .and_then(Value::as_u64)
        .unwrap_or(READ_MAX_BYTES_DEFAULT) as usize;
    let bytes = tokio::fs::read(&path).await?;
    let slice = &bytes[..bytes.len().min(max_bytes)];
    Ok(ToolOutput::text(String::from_utf8_lossy(slice).to_string()))
}

async fn write_text_file(ws: Arc<FileWorkspace>, args: Value) -> Result<ToolOutput> {
    let path = ws.resolve(FileLocation::Generated, str_arg(&args, "file_path")?)?;
    let content = str_arg(&args, "content")?;
    write_file(&path, content.as_bytes()).await?;
    let shown = ws.display(&path);
    Ok(ToolOutput::text(format!("wrote {} bytes to {shown}", content.len())).with_created_file(shown))
}

async fn create_new_version(ws: Arc<FileWorkspace>, args: Value) -> Result<ToolOutput> {
    let requested = ws.resolve(FileLocation::Generated, str_arg(&args, "file_path")?)?;
    let path = if requested.exists() {
        next_version_path(&requested)
    } else {
        requested
    };
    write_file(&path, str_arg(&args, "content")?.as_bytes()).await?;
    let shown = ws.display(&path);
    Ok(ToolOutput::text(format!("created {shown}")).with_created_file(shown))
}

async fn create_json_file(ws: Arc<FileWorkspace>, args: Value) -> Result<ToolOutput> {
    let mut relative = str_arg(&args, "file_path")?.to_string();
    if !relative.to_ascii_lowercase().ends_with(".json") {
        relative.push_str(".json");
    }
    let path = ws.resolve(FileLocation::Generated, &relative)?;
    let data = args.get("data").ok_or_else(|| anyhow!("data missing"))?;
    write_file(&path, &serde_json::to_vec_pretty(data)?).await?;
    let shown = ws.display(&path);
    Ok(ToolOutput::text(format!("created {shown}")).with_created_file(shown))
}

async fn merge_text_files(ws: Arc<FileWorkspace>, args: Value) -> Result<ToolOutput> {
    let sources = args
        .get("file_paths")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("file_paths missing"))?;
    if sources.is_empty() {
        bail!("file_paths must not be empty");
    }
    let separator = args.get("separator").and_then(Value::as_str).unwrap_or("\n");
    let mut parts = Vec::with_capacity(sources.len());
    for source in sources {
        let relative = source
            .as_str()
            .ok_or_else(|| anyhow!("file_paths entries must be strings"))?;
        let path = ws.resolve_existing(relative)?;
        parts.push(tokio::fs::read_to_string(&path).await?);
    }
    let output = ws.resolve(FileLocation::Generated, str_arg(&args, "output_path")?)?;
    write_file(&output, parts.join(separator).as_bytes()).await?;
    let shown = ws.display(&output);
    Ok(ToolOutput::text(format!("merged {} files into {shown}", parts.len())).with_created_file(shown))
}

async fn delete_file(ws: Arc<FileWorkspace>, args: Value) -> Result<ToolOutput> {
    let path = ws.resolve(FileLocation::Generated, str_arg(&args, "file_path")?)?;
    if !path.is_file() {
        bail!("file not found: {}", ws.display(&path));
    }
    tokio::fs::remove_file(&path).await?;
    Ok(ToolOutput::text(format!("deleted {}", ws.display(&path))))
}
