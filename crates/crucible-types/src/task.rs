use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelRequirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    /// Forward-only edges. `Failed -> Queued` is the retry edge; whether it is
    /// still available depends on the attempt budget, which the queue checks.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Queued)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied description of a unit of work before it is queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub requirements: ModelRequirements,
}

fn default_required() -> bool {
    true
}

impl TaskSpec {
    pub fn new(role: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            role: role.into(),
            prompt: prompt.into(),
            system_prompt: None,
            required: true,
            requirements: ModelRequirements::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub directive_id: String,
    pub role: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub required: bool,
    #[serde(default)]
    pub requirements: ModelRequirements,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn from_spec(directive_id: &str, spec: TaskSpec) -> Self {
        Self {
            id: spec.id.unwrap_or_else(crate::new_id),
            directive_id: directive_id.to_string(),
            role: spec.role,
            prompt: spec.prompt,
            system_prompt: spec.system_prompt,
            required: spec.required,
            requirements: spec.requirements,
            status: TaskStatus::Queued,
            attempt: 0,
            model_id: None,
            result: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// The queue only leaves a task in `failed` once it will not be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_edges_only_move_forward() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Succeeded));
    }

    #[test]
    fn task_spec_defaults_to_required() {
        let spec: TaskSpec =
            serde_json::from_str(r#"{"role":"coder","prompt":"write it"}"#).expect("parse");
        assert!(spec.required);
        let task = Task::from_spec("d-1", spec);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 0);
        assert!(!task.id.is_empty());
    }
}
