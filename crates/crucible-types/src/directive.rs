use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Task, TaskSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl DirectiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DirectiveStatus::Pending => "pending",
            DirectiveStatus::Running => "running",
            DirectiveStatus::Succeeded => "succeeded",
            DirectiveStatus::Failed => "failed",
        }
    }
}

/// What a caller (job manager, CLI) submits. `tasks` may be empty, in which
/// case the runner asks its planner to decompose `objective`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub objective: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub excluded_model_ids: Vec<String>,
    #[serde(default)]
    pub excluded_group_ids: Vec<String>,
}

impl DirectiveSpec {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: None,
            objective: objective.into(),
            tasks: Vec::new(),
            excluded_model_ids: Vec::new(),
            excluded_group_ids: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub id: String,
    pub objective: String,
    pub tasks: Vec<Task>,
    pub status: DirectiveStatus,
    #[serde(default)]
    pub excluded_model_ids: Vec<String>,
    #[serde(default)]
    pub excluded_group_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Directive {
    pub fn from_spec(spec: DirectiveSpec, tasks: Vec<TaskSpec>) -> Self {
        let id = spec.id.unwrap_or_else(crate::new_id);
        let tasks = tasks
            .into_iter()
            .map(|task| Task::from_spec(&id, task))
            .collect();
        Self {
            id,
            objective: spec.objective,
            tasks,
            status: DirectiveStatus::Pending,
            excluded_model_ids: spec.excluded_model_ids,
            excluded_group_ids: spec.excluded_group_ids,
            created_at: Utc::now(),
        }
    }
}

/// The first task failure that made a directive fail, with the id of the
/// terminal `task.failed` trace event for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectiveFailure {
    pub task_id: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_event_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveResult {
    pub directive_id: String,
    pub status: DirectiveStatus,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<DirectiveFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DirectiveResult {
    pub fn succeeded(&self) -> bool {
        self.status == DirectiveStatus::Succeeded
    }
}
