use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::{json, Value};
use tokio::fs;

use crucible_types::{ToolResult, ToolSchema};

use crate::{Tool, ToolContext, ToolError};

const MAX_LISTED: usize = 500;
const MAX_MATCHES: usize = 100;

pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(EditFileTool),
        Arc::new(ListFilesTool),
        Arc::new(GlobTool),
        Arc::new(GrepTool),
    ]
}

/// Relative paths of every file under `root`, sorted, skipping `.git`.
/// Ignore files are not honoured so build outputs still count.
pub fn list_workspace_files(root: &Path) -> Vec<String> {
    let mut files = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_exclude(false)
        .git_global(false)
        .ignore(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build()
        .flatten()
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

fn str_arg<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing string argument `{key}`"))
}

struct ReadFileTool;
#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_file".to_string(),
            description: "Read a file from the workspace".to_string(),
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"}},"required":["path"]}),
        }
    }
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let path = str_arg(&args, "path")?;
        let resolved = ctx.resolve(path)?;
        let data = fs::read_to_string(&resolved).await?;
        Ok(ToolResult {
            metadata: json!({"path": path, "bytes": data.len()}),
            output: data,
        })
    }
}

struct WriteFileTool;
#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write_file".to_string(),
            description: "Create or overwrite a file in the workspace".to_string(),
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"},"content":{"type":"string"}},"required":["path","content"]}),
        }
    }
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let path = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;
        let resolved = ctx.resolve(path)?;
        if resolved == ctx.workspace_root {
            return Err(ToolError::PathNotAllowed(path.to_string()).into());
        }
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&resolved, content).await?;
        Ok(ToolResult {
            output: format!("wrote {} bytes to {path}", content.len()),
            metadata: json!({"path": path, "bytes": content.len()}),
        })
    }
}

struct EditFileTool;
#[async_trait]
impl Tool for EditFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit_file".to_string(),
            description: "Replace every occurrence of a string in a workspace file".to_string(),
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"},"old":{"type":"string"},"new":{"type":"string"}},"required":["path","old","new"]}),
        }
    }
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let path = str_arg(&args, "path")?;
        let old = str_arg(&args, "old")?;
        let new = str_arg(&args, "new")?;
        if old.is_empty() {
            anyhow::bail!("`old` must not be empty");
        }
        let resolved = ctx.resolve(path)?;
        let content = fs::read_to_string(&resolved).await?;
        let count = content.matches(old).count();
        if count == 0 {
            anyhow::bail!("`{old}` not found in {path}");
        }
        fs::write(&resolved, content.replace(old, new)).await?;
        Ok(ToolResult {
            output: format!("replaced {count} occurrence(s) in {path}"),
            metadata: json!({"path": path, "replacements": count}),
        })
    }
}

struct ListFilesTool;
#[async_trait]
impl Tool for ListFilesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "list_files".to_string(),
            description: "List files under a workspace directory".to_string(),
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"}}}),
        }
    }
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let resolved = ctx.resolve(path)?;
        let root = ctx.workspace_root.clone();
        let files = tokio::task::spawn_blocking(move || {
            list_workspace_files(&resolved)
                .into_iter()
                .map(|rel| {
                    let full = resolved.join(&rel);
                    full.strip_prefix(&root)
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                        .unwrap_or(rel)
                })
                .take(MAX_LISTED)
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(ToolResult {
            output: files.join("\n"),
            metadata: json!({"count": files.len()}),
        })
    }
}

struct GlobTool;
#[async_trait]
impl Tool for GlobTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "glob".to_string(),
            description: "Find workspace files by glob pattern".to_string(),
            input_schema: json!({"type":"object","properties":{"pattern":{"type":"string"}},"required":["pattern"]}),
        }
    }
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = str_arg(&args, "pattern")?;
        if pattern.contains("..") || Path::new(pattern).is_absolute() {
            return Err(ToolError::PathNotAllowed(pattern.to_string()).into());
        }
        let root = ctx.workspace_root.clone();
        let full = format!(
            "{}/{}",
            glob::Pattern::escape(&root.to_string_lossy()),
            pattern
        );
        let mut files = Vec::new();
        for path in glob::glob(&full)?.flatten() {
            if let Ok(rel) = path.strip_prefix(&root) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
            if files.len() >= MAX_MATCHES {
                break;
            }
        }
        Ok(ToolResult {
            output: files.join("\n"),
            metadata: json!({"count": files.len()}),
        })
    }
}

struct GrepTool;
#[async_trait]
impl Tool for GrepTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "grep".to_string(),
            description: "Regex search across workspace files".to_string(),
            input_schema: json!({"type":"object","properties":{"pattern":{"type":"string"},"path":{"type":"string"}},"required":["pattern"]}),
        }
    }
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = str_arg(&args, "pattern")?;
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let resolved = ctx.resolve(path)?;
        let regex = Regex::new(pattern)?;
        let mut out = Vec::new();
        'files: for rel in list_workspace_files(&resolved) {
            let Ok(content) = fs::read_to_string(resolved.join(&rel)).await else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    out.push(format!("{rel}:{}:{}", idx + 1, line));
                    if out.len() >= MAX_MATCHES {
                        break 'files;
                    }
                }
            }
        }
        Ok(ToolResult {
            output: out.join("\n"),
            metadata: json!({"count": out.len()}),
        })
    }
}
