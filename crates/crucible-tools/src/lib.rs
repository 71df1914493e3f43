use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crucible_types::{ToolResult, ToolSchema};

pub mod interpreter;
mod workspace;

pub use interpreter::{
    extract_source_blocks, extract_tool_calls, mentions_tool_call, InterpreterError,
    SafeCodeInterpreter, CALL_TOOL,
};
pub use workspace::{builtin_tools, list_workspace_files};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool `{tool}` failed: {message}")]
    Execution { tool: String, message: String },

    #[error("path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("invalid tool schema `{tool}` at `{path}`: {reason}")]
    InvalidSchema {
        tool: String,
        path: String,
        reason: String,
    },
}

/// Filesystem scope handed to every tool invocation. Tools may only touch
/// paths under `workspace_root`.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
}

impl ToolContext {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    /// Resolves a tool-supplied relative path inside the workspace. Absolute
    /// paths, `..` components and symlinks that lead outside are refused.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let trimmed = raw.trim();
        if !is_path_allowed(trimmed) {
            return Err(ToolError::PathNotAllowed(raw.to_string()));
        }
        let joined = if trimmed.is_empty() || trimmed == "." {
            self.workspace_root.clone()
        } else {
            self.workspace_root.join(trimmed)
        };
        if let (Ok(root), Ok(real)) = (
            self.workspace_root.canonicalize(),
            existing_ancestor(&joined).canonicalize(),
        ) {
            if !real.starts_with(&root) {
                return Err(ToolError::PathNotAllowed(raw.to_string()));
            }
        }
        Ok(joined)
    }
}

fn existing_ancestor(path: &Path) -> &Path {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

fn is_path_allowed(path: &str) -> bool {
    let raw = Path::new(path);
    if raw.is_absolute() || raw.has_root() {
        return false;
    }
    !raw.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        )
    })
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult>;
}

/// Closed name -> handler map. Tools exist only once explicitly registered.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the workspace file tools.
    pub fn with_builtin_tools() -> Self {
        let map = builtin_tools()
            .into_iter()
            .map(|tool| (tool.schema().name, tool))
            .collect::<HashMap<_, _>>();
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    /// Adds or replaces a tool under its schema name.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let schema = tool.schema();
        validate_tool_schemas(std::slice::from_ref(&schema))?;
        let replaced = self.tools.write().await.insert(schema.name.clone(), tool);
        if replaced.is_some() {
            tracing::debug!(tool = %schema.name, "replaced registered tool");
        }
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn schema(&self, name: &str) -> Option<ToolSchema> {
        self.tools.read().await.get(name).map(|tool| tool.schema())
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: Value,
    ) -> Result<ToolResult, ToolError> {
        let tool = self.tools.read().await.get(name).cloned();
        let Some(tool) = tool else {
            return Err(ToolError::NotFound(name.to_string()));
        };
        tool.execute(ctx, args).await.map_err(|err| match err.downcast::<ToolError>() {
            Ok(tool_err) => tool_err,
            Err(err) => ToolError::Execution {
                tool: name.to_string(),
                message: format!("{err:#}"),
            },
        })
    }
}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(tool_name: &str, path: &str, value: &Value) -> Result<(), ToolError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolError::InvalidSchema {
            tool: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(combinator).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{combinator}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    struct BadSchemaTool;

    #[async_trait]
    impl Tool for BadSchemaTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "bad".to_string(),
                description: "bad schema".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"items": {"type": "array"}}
                }),
            }
        }

        async fn execute(&self, _ctx: &ToolContext, _args: Value) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::text(""))
        }
    }

    #[tokio::test]
    async fn register_rejects_invalid_schema() {
        let registry = ToolRegistry::new();
        let err = registry.register(Arc::new(BadSchemaTool)).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidSchema { ref path, .. } if path.contains("properties.items")));
        assert!(!registry.contains("bad").await);
    }

    #[tokio::test]
    async fn builtin_schemas_are_unique_and_valid() {
        let registry = ToolRegistry::with_builtin_tools();
        let schemas = registry.list().await;
        validate_tool_schemas(&schemas).expect("builtin schemas validate");
        let unique = schemas
            .iter()
            .map(|schema| schema.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), schemas.len());
        assert!(unique.contains("read_file"));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let ctx = ToolContext::new(std::env::temp_dir());
        let err = registry.execute("nope", &ctx, json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "nope"));
    }

    #[test]
    fn resolve_refuses_escapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ToolContext::new(dir.path());
        assert!(ctx.resolve("src/main.rs").is_ok());
        assert!(ctx.resolve(".").is_ok());
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b"] {
            assert!(
                matches!(ctx.resolve(bad), Err(ToolError::PathNotAllowed(_))),
                "{bad}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn resolve_refuses_symlink_out_of_workspace() {
        let outside = tempfile::tempdir().expect("outside");
        let dir = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).expect("symlink");
        let ctx = ToolContext::new(dir.path());
        assert!(matches!(
            ctx.resolve("link/secret.txt"),
            Err(ToolError::PathNotAllowed(_))
        ));
    }
}
