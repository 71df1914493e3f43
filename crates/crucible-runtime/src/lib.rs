use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crucible_tools::{SafeCodeInterpreter, ToolContext};

mod arena;
mod backend;

pub use arena::{ArenaRequest, ArenaRun, CleanupOutcome, IsolationArena};
pub use backend::{GitWorktreeBackend, ScratchBackend, WorkspaceBackend};

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("failed to set up isolated workspace for task `{task_id}`: {message}")]
    IsolationSetup { task_id: String, message: String },

    #[error("path is outside the isolation root: {0}")]
    OutsideRoot(PathBuf),
}

/// One isolated workspace. Owned by the arena from creation until an explicit
/// cleanup; never shared between concurrent runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IsolationHandle {
    pub path: PathBuf,
    pub branch_name: String,
    pub task_id: String,
    pub variant_id: String,
}

/// Everything an agent loop gets to see while running inside an arena.
#[derive(Clone)]
pub struct AgentContext {
    pub task_id: String,
    pub variant_id: String,
    pub workspace_root: PathBuf,
    pub task_prompt: String,
    pub system_prompt: String,
    pub tools: ToolContext,
    pub interpreter: SafeCodeInterpreter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: String,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl AgentOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            logs: Vec::new(),
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput>;
}
