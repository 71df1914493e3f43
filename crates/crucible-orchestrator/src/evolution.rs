use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crucible_core::{ActiveRunRegistry, EventBus, Repository, RunKind};
use crucible_observability::redact_text;
use crucible_providers::CompletionClient;
use crucible_runtime::{AgentRunner, ArenaError, ArenaRequest, ArenaRun, IsolationArena};
use crucible_types::{new_id, ChatMessage, CompletionRequest, Role, TraceKind};

use crate::agent_loop::AgentLoop;
use crate::bandit::BanditSelector;

#[derive(Debug, Error)]
pub enum EvolutionError {
    #[error("unknown role `{0}`")]
    UnknownRole(String),

    #[error("experiment `{0}` is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error("assessment failed: {0}")]
    Assessment(String),

    #[error("experiment cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Baseline,
    Challenger,
}

impl VariantKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VariantKind::Baseline => "baseline",
            VariantKind::Challenger => "challenger",
        }
    }
}

/// How one variant of a role is run.
#[derive(Debug, Clone, Serialize)]
pub struct VariantConfig {
    pub kind: VariantKind,
    pub variant_id: String,
    pub system_prompt: String,
    pub max_turns: usize,
    pub temperature: f32,
}

impl VariantConfig {
    /// Short, conservative run on the plain role prompt.
    pub fn baseline(role: &Role) -> Self {
        Self {
            kind: VariantKind::Baseline,
            variant_id: VariantKind::Baseline.as_str().to_string(),
            system_prompt: role.system_prompt.clone(),
            max_turns: 2,
            temperature: 0.2,
        }
    }

    /// Longer, more exploratory run with planning and verification steps
    /// tailored to the domain.
    pub fn challenger(role: &Role, domain: &str) -> Self {
        Self {
            kind: VariantKind::Challenger,
            variant_id: VariantKind::Challenger.as_str().to_string(),
            system_prompt: format!(
                "{}\n\n{}",
                role.system_prompt.trim_end(),
                domain_instructions(domain)
            ),
            max_turns: 6,
            temperature: 0.7,
        }
    }
}

fn domain_instructions(domain: &str) -> String {
    let checks = match domain.to_ascii_lowercase().as_str() {
        "frontend" | "ui" | "web" => {
            "Check markup structure, accessibility attributes and that every referenced asset exists."
        }
        "backend" | "api" | "server" => {
            "Check request validation, error paths and that every new endpoint is wired into routing."
        }
        "data" | "analytics" | "ml" => {
            "Check input schemas, empty and malformed rows, and that outputs are reproducible."
        }
        "docs" | "documentation" | "writing" => {
            "Check that every example is accurate and that headings match the content beneath them."
        }
        _ => "Check the result against each stated requirement.",
    };
    format!(
        "You are working in the `{domain}` domain. Before touching any file, write a numbered \
         plan. Work through it one step at a time using the available tools. When you are done, \
         read back what you changed and verify it. {checks} Fix anything that fails before giving \
         your final answer."
    )
}

/// Builds the agent that runs a given variant.
pub trait VariantRunnerFactory: Send + Sync {
    fn runner(&self, variant: &VariantConfig) -> Arc<dyn AgentRunner>;
}

pub struct AgentLoopFactory {
    client: CompletionClient,
    model_id: String,
    events: Option<EventBus>,
}

impl AgentLoopFactory {
    pub fn new(client: CompletionClient, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }
}

impl VariantRunnerFactory for AgentLoopFactory {
    fn runner(&self, variant: &VariantConfig) -> Arc<dyn AgentRunner> {
        let mut agent = AgentLoop::new(self.client.clone(), self.model_id.clone())
            .with_max_turns(variant.max_turns)
            .with_temperature(variant.temperature);
        if let Some(events) = &self.events {
            agent = agent.with_events(events.clone());
        }
        Arc::new(agent)
    }
}

/// Raw run data handed to an assessor. Carries no variant label.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub submission_id: String,
    pub output: String,
    pub exit_code: i32,
    pub artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub submission_id: String,
    /// 0 to 10.
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
}

#[async_trait]
pub trait Assessor: Send + Sync {
    async fn assess(
        &self,
        task_prompt: &str,
        domain: &str,
        submissions: &[Submission],
    ) -> anyhow::Result<Vec<Assessment>>;
}

/// Scores on exit status, output and artifacts alone.
pub struct HeuristicAssessor;

#[async_trait]
impl Assessor for HeuristicAssessor {
    async fn assess(
        &self,
        _task_prompt: &str,
        _domain: &str,
        submissions: &[Submission],
    ) -> anyhow::Result<Vec<Assessment>> {
        Ok(submissions
            .iter()
            .map(|submission| {
                let (score, rationale) = if submission.exit_code != 0 {
                    (0.0, "run failed".to_string())
                } else {
                    let mut score = 5.0;
                    let mut notes = vec!["run succeeded"];
                    if !submission.output.trim().is_empty() {
                        score += 3.0;
                        notes.push("produced an answer");
                    }
                    if !submission.artifacts.is_empty() {
                        score += 2.0;
                        notes.push("left files in the workspace");
                    }
                    (score, notes.join(", "))
                };
                Assessment {
                    submission_id: submission.submission_id.clone(),
                    score,
                    rationale,
                }
            })
            .collect())
    }
}

/// Asks a model to grade the submissions and parses its JSON verdict.
pub struct LlmAssessor {
    client: CompletionClient,
    model_id: String,
}

#[derive(Deserialize)]
struct ScoreSheet {
    scores: Vec<Assessment>,
}

impl LlmAssessor {
    pub fn new(client: CompletionClient, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl Assessor for LlmAssessor {
    async fn assess(
        &self,
        task_prompt: &str,
        domain: &str,
        submissions: &[Submission],
    ) -> anyhow::Result<Vec<Assessment>> {
        let request = CompletionRequest {
            model_id: self.model_id.clone(),
            messages: vec![
                ChatMessage::system(
                    "You grade independent attempts at the same task. Judge only the evidence \
                     given. Reply with JSON only: {\"scores\":[{\"submission_id\":\"...\",\
                     \"score\":0-10,\"rationale\":\"...\"}]} with one entry per submission.",
                ),
                ChatMessage::user(format!(
                    "Domain: {domain}\n\nTask:\n{task_prompt}\n\nSubmissions:\n{}",
                    serde_json::to_string_pretty(submissions)?
                )),
            ],
            temperature: Some(0.0),
            max_tokens: None,
        };
        let reply = self.client.complete(&request).await?;
        parse_score_sheet(&reply)
    }
}

fn parse_score_sheet(reply: &str) -> anyhow::Result<Vec<Assessment>> {
    let start = reply
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("assessor reply has no JSON object"))?;
    let end = reply
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow::anyhow!("assessor reply has no JSON object"))?;
    let sheet: ScoreSheet = serde_json::from_str(&reply[start..=end]).map_err(|err| {
        // serde's message quotes the offending value, so only its position is kept.
        anyhow::anyhow!(
            "assessor reply is not a score sheet ({:?} error at line {} column {}): {}",
            err.classify(),
            err.line(),
            err.column(),
            redact_text(reply)
        )
    })?;
    Ok(sheet
        .scores
        .into_iter()
        .map(|mut assessment| {
            if !assessment.score.is_finite() {
                assessment.score = 0.0;
            }
            assessment.score = assessment.score.clamp(0.0, 10.0);
            assessment
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantOutcome {
    pub variant_id: String,
    pub kind: VariantKind,
    pub submission_id: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub artifacts: Vec<String>,
    pub output: String,
    pub duration_ms: u64,
    pub score: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Experiment {
    pub id: String,
    pub role_id: String,
    pub domain: String,
    pub task_prompt: String,
    pub status: ExperimentStatus,
    pub variants: Vec<VariantOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<VariantKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Races a baseline and a challenger variant of a role in separate
/// workspaces and lets a blind assessor pick the better run.
pub struct EvolutionEngine {
    arena: Arc<IsolationArena>,
    factory: Arc<dyn VariantRunnerFactory>,
    assessor: Arc<dyn Assessor>,
    roles: Arc<dyn Repository<Role>>,
    bandit: Arc<BanditSelector>,
    events: EventBus,
    runs: ActiveRunRegistry,
    experiments: RwLock<HashMap<String, Experiment>>,
}

impl EvolutionEngine {
    pub fn new(
        arena: Arc<IsolationArena>,
        factory: Arc<dyn VariantRunnerFactory>,
        assessor: Arc<dyn Assessor>,
        roles: Arc<dyn Repository<Role>>,
        bandit: Arc<BanditSelector>,
        events: EventBus,
        runs: ActiveRunRegistry,
    ) -> Self {
        Self {
            arena,
            factory,
            assessor,
            roles,
            bandit,
            events,
            runs,
            experiments: RwLock::new(HashMap::new()),
        }
    }

    pub fn arm_id(role_id: &str, kind: VariantKind) -> String {
        format!("{role_id}/{}", kind.as_str())
    }

    pub async fn get_experiment(&self, experiment_id: &str) -> Option<Experiment> {
        self.experiments.read().await.get(experiment_id).cloned()
    }

    pub async fn list_experiments(&self) -> Vec<Experiment> {
        let mut all = self
            .experiments
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        all.sort_by_key(|experiment| experiment.started_at);
        all
    }

    pub async fn cancel(&self, experiment_id: &str) -> bool {
        self.runs.cancel(experiment_id).await
    }

    /// Runs one experiment to completion and returns its id. Both workspaces
    /// are removed before this returns, whatever happened to the runs.
    pub async fn evolve(
        &self,
        role_id: &str,
        task_prompt: &str,
        domain: &str,
    ) -> Result<String, EvolutionError> {
        let role = self
            .roles
            .find(role_id)
            .await?
            .ok_or_else(|| EvolutionError::UnknownRole(role_id.to_string()))?;
        let experiment_id = new_id();
        let active = self
            .runs
            .acquire(&experiment_id, RunKind::Experiment)
            .await
            .map_err(|existing| EvolutionError::AlreadyRunning(existing.run_id))?;

        let mut experiment = Experiment {
            id: experiment_id.clone(),
            role_id: role.id.clone(),
            domain: domain.to_string(),
            task_prompt: task_prompt.to_string(),
            status: ExperimentStatus::Running,
            variants: Vec::new(),
            winner: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.experiments
            .write()
            .await
            .insert(experiment_id.clone(), experiment.clone());

        let outcome = self.race(&experiment, &role, &active.cancel).await;
        self.runs.finish(&experiment_id).await;

        experiment.finished_at = Some(Utc::now());
        let result = match outcome {
            Ok((variants, winner)) => {
                experiment.status = ExperimentStatus::Completed;
                experiment.variants = variants;
                experiment.winner = Some(winner);
                Ok(experiment_id.clone())
            }
            Err(err) => {
                experiment.status = ExperimentStatus::Failed;
                experiment.error = Some(err.to_string());
                Err(err)
            }
        };
        self.events.emit(
            TraceKind::ExperimentCompleted,
            json!({
                "experimentID": experiment.id,
                "roleID": experiment.role_id,
                "status": experiment.status,
                "winner": experiment.winner.map(VariantKind::as_str),
                "error": experiment.error,
            }),
        );
        tracing::info!(
            experiment_id = %experiment.id,
            role_id = %experiment.role_id,
            status = ?experiment.status,
            winner = ?experiment.winner,
            "experiment finished"
        );
        self.experiments
            .write()
            .await
            .insert(experiment_id, experiment);
        result
    }

    async fn race(
        &self,
        experiment: &Experiment,
        role: &Role,
        cancel: &CancellationToken,
    ) -> Result<(Vec<VariantOutcome>, VariantKind), EvolutionError> {
        let variants = [
            VariantConfig::baseline(role),
            VariantConfig::challenger(role, &experiment.domain),
        ];
        self.events.emit(
            TraceKind::ExperimentStarted,
            json!({
                "experimentID": experiment.id,
                "roleID": role.id,
                "domain": experiment.domain,
                "variants": variants.iter().map(|v| v.variant_id.clone()).collect::<Vec<_>>(),
            }),
        );

        let raced = async {
            tokio::join!(
                self.run_variant(experiment, &variants[0]),
                self.run_variant(experiment, &variants[1]),
            )
        };
        let runs = tokio::select! {
            (baseline, challenger) = raced => [baseline, challenger],
            _ = cancel.cancelled() => {
                // Dropping the race stops both agents; their workspaces are
                // still registered with the arena.
                self.abandon(experiment).await;
                return Err(EvolutionError::Cancelled);
            }
        };

        let judged = self.judge(experiment, role, &variants, &runs, cancel).await;
        for run in runs.iter().flatten() {
            self.arena.cleanup(run.handle_path()).await;
        }
        judged
    }

    async fn abandon(&self, experiment: &Experiment) {
        let handles = self
            .arena
            .active_handles()
            .into_iter()
            .filter(|handle| handle.task_id == experiment.id);
        for handle in handles {
            self.arena.cleanup(&handle.path).await;
        }
        tracing::info!(experiment_id = %experiment.id, "experiment cancelled mid-race");
    }

    async fn run_variant(
        &self,
        experiment: &Experiment,
        variant: &VariantConfig,
    ) -> Result<ArenaRun, ArenaError> {
        let request = ArenaRequest::new(
            experiment.id.clone(),
            variant.variant_id.clone(),
            experiment.task_prompt.clone(),
            variant.system_prompt.clone(),
        );
        let run = self
            .arena
            .run(request, self.factory.runner(variant))
            .await?;
        self.events.emit(
            TraceKind::VariantCompleted,
            json!({
                "experimentID": experiment.id,
                "variantID": variant.variant_id,
                "exitCode": run.exit_code,
                "durationMs": run.duration_ms,
                "artifactCount": run.artifacts.len(),
                "error": run.error,
            }),
        );
        Ok(run)
    }

    async fn judge(
        &self,
        experiment: &Experiment,
        role: &Role,
        variants: &[VariantConfig; 2],
        runs: &[Result<ArenaRun, ArenaError>; 2],
        cancel: &CancellationToken,
    ) -> Result<(Vec<VariantOutcome>, VariantKind), EvolutionError> {
        let mut finished = Vec::with_capacity(2);
        for (variant, run) in variants.iter().zip(runs) {
            match run {
                Ok(run) => finished.push((variant, run)),
                Err(err) => {
                    return Err(EvolutionError::Arena(ArenaError::IsolationSetup {
                        task_id: experiment.id.clone(),
                        message: format!("{} variant: {err}", variant.variant_id),
                    }))
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(EvolutionError::Cancelled);
        }

        let mut submissions = finished
            .iter()
            .map(|(_, run)| Submission {
                submission_id: new_id(),
                output: run.output.clone(),
                exit_code: run.exit_code,
                artifacts: run.artifacts.clone(),
                error: run.error.clone(),
            })
            .collect::<Vec<_>>();
        let labels = submissions
            .iter()
            .map(|s| s.submission_id.clone())
            .collect::<Vec<_>>();
        submissions.shuffle(&mut rand::thread_rng());

        let assessments = self
            .assessor
            .assess(&experiment.task_prompt, &experiment.domain, &submissions)
            .await
            .map_err(|err| EvolutionError::Assessment(format!("{err:#}")))?;
        let by_id = assessments
            .into_iter()
            .map(|a| (a.submission_id.clone(), a))
            .collect::<HashMap<_, _>>();

        let mut outcomes = Vec::with_capacity(2);
        for ((variant, run), submission_id) in finished.into_iter().zip(labels) {
            let assessment = by_id.get(&submission_id).ok_or_else(|| {
                EvolutionError::Assessment(format!("no score for submission {submission_id}"))
            })?;
            let score = if assessment.score.is_finite() {
                assessment.score.clamp(0.0, 10.0)
            } else {
                0.0
            };
            self.bandit
                .record_reward(&Self::arm_id(&role.id, variant.kind), score / 10.0);
            outcomes.push(VariantOutcome {
                variant_id: variant.variant_id.clone(),
                kind: variant.kind,
                submission_id,
                exit_code: run.exit_code,
                error: run.error.clone(),
                artifacts: run.artifacts.clone(),
                output: run.output.clone(),
                duration_ms: run.duration_ms,
                score,
                rationale: assessment.rationale.clone(),
            });
        }

        let score_of = |kind: VariantKind| {
            outcomes
                .iter()
                .find(|o| o.kind == kind)
                .map(|o| o.score)
                .unwrap_or(0.0)
        };
        // Ties keep the baseline.
        let winner = if score_of(VariantKind::Challenger) > score_of(VariantKind::Baseline) {
            VariantKind::Challenger
        } else {
            VariantKind::Baseline
        };
        self.events.emit(
            TraceKind::ExperimentAssessed,
            json!({
                "experimentID": experiment.id,
                "scores": {
                    "baseline": score_of(VariantKind::Baseline),
                    "challenger": score_of(VariantKind::Challenger),
                },
                "winner": winner.as_str(),
            }),
        );
        Ok((outcomes, winner))
    }
}
