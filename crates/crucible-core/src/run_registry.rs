use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Directive,
    Experiment,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    #[serde(rename = "runID")]
    pub run_id: String,
    pub kind: RunKind,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// Directives and experiments currently executing, each with its own
/// cancellation token. Constructed once and shared by reference.
#[derive(Clone, Default)]
pub struct ActiveRunRegistry {
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run; returns the existing entry if the id is already active.
    pub async fn acquire(&self, run_id: &str, kind: RunKind) -> Result<ActiveRun, ActiveRun> {
        let mut guard = self.active.write().await;
        if let Some(existing) = guard.get(run_id) {
            return Err(existing.clone());
        }
        let run = ActiveRun {
            run_id: run_id.to_string(),
            kind,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        };
        guard.insert(run_id.to_string(), run.clone());
        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> Option<ActiveRun> {
        self.active.read().await.get(run_id).cloned()
    }

    pub async fn list(&self) -> Vec<ActiveRun> {
        let mut runs = self
            .active
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by_key(|run| run.started_at);
        runs
    }

    /// Returns false when the id is not running.
    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.active.read().await.get(run_id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn finish(&self, run_id: &str) -> Option<ActiveRun> {
        self.active.write().await.remove(run_id)
    }
}
