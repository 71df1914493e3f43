use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crucible_core::{ActiveRunRegistry, EventBus, OrchestratorConfig, Repository, RunKind};
use crucible_observability::{emit_event, EngineEvent};
use crucible_providers::CompletionClient;
use crucible_runtime::{ArenaRequest, IsolationArena};
use crucible_types::{
    Directive, DirectiveFailure, DirectiveResult, DirectiveSpec, DirectiveStatus, JobRecord, Role,
    Task, TaskSpec, TaskStatus, TraceEvent, TraceKind,
};

use crate::agent_loop::AgentLoop;
use crate::bandit::BanditSelector;
use crate::model_selector::ModelSelector;
use crate::task_queue::{FailOutcome, TaskQueue};
use crate::SelectionError;

const CANCELLED: &str = "directive cancelled";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable software engineer.";

/// Turns a directive without pre-supplied tasks into task specs.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, directive: &DirectiveSpec) -> anyhow::Result<Vec<TaskSpec>>;
}

/// One task carrying the directive objective.
pub struct SingleTaskPlanner {
    role: String,
}

impl SingleTaskPlanner {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl Default for SingleTaskPlanner {
    fn default() -> Self {
        Self::new("generalist")
    }
}

#[async_trait]
impl Planner for SingleTaskPlanner {
    async fn plan(&self, directive: &DirectiveSpec) -> anyhow::Result<Vec<TaskSpec>> {
        Ok(vec![TaskSpec::new(self.role.clone(), directive.objective.clone())])
    }
}

/// A single attempt at a task, bound to the model chosen for it.
#[derive(Debug, Clone)]
pub struct TaskAttempt {
    pub task: Task,
    pub model_id: String,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, attempt: TaskAttempt) -> anyhow::Result<String>;
}

/// Runs each attempt as an agent loop inside a fresh isolated workspace.
pub struct ArenaTaskExecutor {
    arena: Arc<IsolationArena>,
    client: CompletionClient,
    roles: Arc<dyn Repository<Role>>,
    events: Option<EventBus>,
    max_turns: usize,
    keep_workspaces: bool,
}

impl ArenaTaskExecutor {
    pub fn new(
        arena: Arc<IsolationArena>,
        client: CompletionClient,
        roles: Arc<dyn Repository<Role>>,
    ) -> Self {
        Self {
            arena,
            client,
            roles,
            events: None,
            max_turns: 6,
            keep_workspaces: false,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Leaves workspaces (and their branches) in place after each attempt.
    pub fn keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    async fn system_prompt(&self, task: &Task) -> anyhow::Result<String> {
        if let Some(prompt) = &task.system_prompt {
            return Ok(prompt.clone());
        }
        let role = self
            .roles
            .find(&task.role)
            .await
            .with_context(|| format!("loading role `{}`", task.role))?;
        Ok(role
            .map(|role| role.system_prompt)
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()))
    }
}

#[async_trait]
impl TaskExecutor for ArenaTaskExecutor {
    async fn execute(&self, attempt: TaskAttempt) -> anyhow::Result<String> {
        if attempt.cancel.is_cancelled() {
            return Err(anyhow!(CANCELLED));
        }
        let task = attempt.task;
        let system_prompt = self.system_prompt(&task).await?;
        let mut agent = AgentLoop::new(self.client.clone(), attempt.model_id)
            .with_max_turns(self.max_turns);
        if let Some(events) = &self.events {
            agent = agent.with_events(events.clone());
        }
        let request = ArenaRequest::new(
            task.id.clone(),
            format!("attempt-{}", task.attempt),
            task.prompt.clone(),
            system_prompt,
        );
        let run = self.arena.run(request, Arc::new(agent)).await?;
        if !self.keep_workspaces {
            self.arena.cleanup(run.handle_path()).await;
        }
        if run.succeeded() {
            Ok(run.output)
        } else {
            Err(anyhow!(run
                .error
                .unwrap_or_else(|| format!("agent exited with code {}", run.exit_code))))
        }
    }
}

type Settled = (String, String, anyhow::Result<String>);

/// Drives a directive's tasks through a [`TaskQueue`] with bounded
/// parallelism, picks a model per attempt and aggregates the outcome.
pub struct DirectiveRunner {
    events: EventBus,
    executor: Arc<dyn TaskExecutor>,
    planner: Arc<dyn Planner>,
    selector: Arc<ModelSelector>,
    bandit: Arc<BanditSelector>,
    runs: ActiveRunRegistry,
    tasks_repo: Option<Arc<dyn Repository<Task>>>,
    jobs_repo: Option<Arc<dyn Repository<JobRecord>>>,
    max_attempts: u32,
    max_parallel: usize,
}

impl DirectiveRunner {
    pub fn new(
        events: EventBus,
        executor: Arc<dyn TaskExecutor>,
        selector: Arc<ModelSelector>,
        bandit: Arc<BanditSelector>,
        runs: ActiveRunRegistry,
    ) -> Self {
        let limits = OrchestratorConfig::default();
        Self {
            events,
            executor,
            planner: Arc::new(SingleTaskPlanner::default()),
            selector,
            bandit,
            runs,
            tasks_repo: None,
            jobs_repo: None,
            max_attempts: limits.max_attempts,
            max_parallel: limits.max_parallel_tasks,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_limits(mut self, config: &OrchestratorConfig) -> Self {
        self.max_attempts = config.max_attempts.max(1);
        self.max_parallel = config.max_parallel_tasks.max(1);
        self
    }

    pub fn with_task_repository(mut self, repo: Arc<dyn Repository<Task>>) -> Self {
        self.tasks_repo = Some(repo);
        self
    }

    pub fn with_job_repository(mut self, repo: Arc<dyn Repository<JobRecord>>) -> Self {
        self.jobs_repo = Some(repo);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn bandit(&self) -> &Arc<BanditSelector> {
        &self.bandit
    }

    /// Stops dispatch for a running directive. Returns false if it is not running.
    pub async fn cancel(&self, directive_id: &str) -> bool {
        self.runs.cancel(directive_id).await
    }

    pub async fn run(&self, spec: DirectiveSpec) -> anyhow::Result<DirectiveResult> {
        let tasks = if spec.tasks.is_empty() {
            self.planner
                .plan(&spec)
                .await
                .context("planning directive tasks")?
        } else {
            spec.tasks.clone()
        };
        if tasks.is_empty() {
            anyhow::bail!("directive has no tasks");
        }
        let mut directive = Directive::from_spec(spec, tasks);
        let run = self
            .runs
            .acquire(&directive.id, RunKind::Directive)
            .await
            .map_err(|existing| anyhow!("directive `{}` is already running", existing.run_id))?;

        let result = self.execute(&mut directive, &run.cancel).await;
        self.runs.finish(&directive.id).await;
        result
    }

    async fn execute(
        &self,
        directive: &mut Directive,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DirectiveResult> {
        let started_at = Utc::now();
        let clock = Instant::now();
        directive.status = DirectiveStatus::Running;
        self.events.emit(
            TraceKind::DirectiveStarted,
            json!({
                "directiveID": directive.id,
                "objective": directive.objective,
                "taskCount": directive.tasks.len(),
            }),
        );
        self.save_job(&directive.id, DirectiveStatus::Running, None)
            .await;

        let queue = Arc::new(TaskQueue::new(self.events.clone(), self.max_attempts));
        for task in std::mem::take(&mut directive.tasks) {
            queue.enqueue(task)?;
        }

        let mut failure = self.drain(directive, &queue, cancel).await;
        let tasks = queue.archive(&directive.id);

        if failure.is_none() {
            failure = tasks
                .iter()
                .find(|task| task.required && task.status != TaskStatus::Succeeded)
                .map(|task| DirectiveFailure {
                    task_id: task.id.clone(),
                    error: task
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("task ended {}", task.status)),
                    trace_event_id: None,
                });
        }
        let status = if failure.is_none() {
            DirectiveStatus::Succeeded
        } else {
            DirectiveStatus::Failed
        };
        directive.status = status;

        if let Some(repo) = &self.tasks_repo {
            for task in &tasks {
                if let Err(err) = repo.save(task.clone()).await {
                    tracing::warn!(task_id = %task.id, error = %err, "task snapshot not persisted");
                }
            }
        }
        let error = failure.as_ref().map(|f| f.error.clone());
        self.save_job(&directive.id, status, error.clone()).await;

        self.events.emit(
            TraceKind::DirectiveCompleted,
            json!({
                "directiveID": directive.id,
                "status": status.as_str(),
                "failedTaskID": failure.as_ref().map(|f| f.task_id.clone()),
                "error": error,
                "traceEventID": failure.as_ref().and_then(|f| f.trace_event_id.clone()),
                "durationMs": clock.elapsed().as_millis() as u64,
            }),
        );
        emit_event(
            if failure.is_none() { Level::INFO } else { Level::WARN },
            EngineEvent {
                event: "directive.finished",
                component: "directive_runner",
                directive_id: Some(&directive.id),
                task_id: failure.as_ref().map(|f| f.task_id.as_str()),
                status: Some(status.as_str()),
                untrusted: error.as_deref(),
                ..Default::default()
            },
        );

        Ok(DirectiveResult {
            directive_id: directive.id.clone(),
            status,
            tasks,
            failure,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Dispatch loop. Returns the first unrecoverable failure of a required task.
    async fn drain(
        &self,
        directive: &Directive,
        queue: &Arc<TaskQueue>,
        cancel: &CancellationToken,
    ) -> Option<DirectiveFailure> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel.max(1)));
        let mut join_set: JoinSet<Settled> = JoinSet::new();
        let mut failed_models: HashMap<String, Vec<String>> = HashMap::new();
        let mut failure = None;
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                tracing::info!(directive_id = %directive.id, "directive cancelled; draining in-flight tasks");
            }

            while !cancelled && queue.has_ready() {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let Some(mut task) = queue.dequeue() else {
                    break;
                };
                let soft = failed_models.get(&task.id).cloned().unwrap_or_default();
                let model_id = match self.choose_model(directive, &task, &soft) {
                    Ok(model_id) => model_id,
                    Err(err) => {
                        tracing::warn!(task_id = %task.id, error = %err, "no model for task");
                        let outcome = queue.fail_terminal(&task.id, &err.to_string());
                        self.note_failure(&mut failure, outcome);
                        continue;
                    }
                };
                if let Err(err) = queue.assign_model(&task.id, &model_id) {
                    tracing::warn!(task_id = %task.id, error = %err, "model assignment lost");
                }
                task.model_id = Some(model_id.clone());

                let executor = self.executor.clone();
                let token = cancel.child_token();
                join_set.spawn(async move {
                    let _permit = permit;
                    let task_id = task.id.clone();
                    let attempt = TaskAttempt {
                        task,
                        model_id: model_id.clone(),
                        cancel: token.clone(),
                    };
                    // Run in its own task so a panicking executor is reported
                    // against this task instead of tearing down the join set.
                    let mut body = tokio::spawn(async move { executor.execute(attempt).await });
                    let result = tokio::select! {
                        joined = &mut body => match joined {
                            Ok(result) => result,
                            Err(err) if err.is_panic() => Err(anyhow!("task executor panicked")),
                            Err(err) => Err(anyhow!("task executor stopped: {err}")),
                        },
                        _ = token.cancelled() => {
                            body.abort();
                            Err(anyhow!(CANCELLED))
                        }
                    };
                    (task_id, model_id, result)
                });
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok((task_id, model_id, result))) => {
                        self.settle(queue, &mut failure, &mut failed_models, task_id, model_id, result, cancelled);
                    }
                    Some(Err(err)) => {
                        tracing::error!(directive_id = %directive.id, error = %err, "task join failed");
                    }
                    None => {}
                },
                _ = cancel.cancelled(), if !cancelled => {}
            }
        }

        if cancelled && failure.is_none() {
            let first_open = queue
                .tasks()
                .into_iter()
                .find(|task| task.status != TaskStatus::Succeeded);
            failure = first_open.map(|task| DirectiveFailure {
                task_id: task.id,
                error: CANCELLED.to_string(),
                trace_event_id: None,
            });
        }
        failure
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        queue: &TaskQueue,
        failure: &mut Option<DirectiveFailure>,
        failed_models: &mut HashMap<String, Vec<String>>,
        task_id: String,
        model_id: String,
        result: anyhow::Result<String>,
        cancelled: bool,
    ) {
        match result {
            Ok(output) => {
                self.bandit.record_reward(&model_id, 1.0);
                if let Err(err) = queue.complete(&task_id, output) {
                    tracing::warn!(task_id = %task_id, error = %err, "completion not recorded");
                }
            }
            Err(err) if cancelled => {
                self.bandit.release(&model_id);
                let outcome = queue.fail_terminal(&task_id, &format!("{err:#}"));
                self.note_failure(failure, outcome);
            }
            Err(err) => {
                self.bandit.record_reward(&model_id, 0.0);
                failed_models
                    .entry(task_id.clone())
                    .or_default()
                    .push(model_id);
                let outcome = queue.fail(&task_id, &format!("{err:#}"));
                self.note_failure(failure, outcome);
            }
        }
    }

    fn note_failure(
        &self,
        failure: &mut Option<DirectiveFailure>,
        outcome: Result<FailOutcome, crate::QueueError>,
    ) {
        match outcome {
            Ok(FailOutcome::Retrying(task)) => {
                tracing::debug!(task_id = %task.id, attempt = task.attempt, "task will retry");
            }
            Ok(FailOutcome::Terminal { task, event }) => {
                if task.required && failure.is_none() {
                    *failure = Some(first_failure(&task, &event));
                }
            }
            Err(err) => tracing::warn!(error = %err, "task failure not recorded"),
        }
    }

    /// Shortlist from the selector, then let the bandit pick. Models that
    /// already failed this task are skipped unless nothing else is left.
    fn choose_model(
        &self,
        directive: &Directive,
        task: &Task,
        failed_before: &[String],
    ) -> Result<String, SelectionError> {
        let mut excluded = directive.excluded_model_ids.clone();
        excluded.extend(failed_before.iter().cloned());
        let shortlist = match self.selector.shortlist(
            &task.requirements,
            &excluded,
            &directive.excluded_group_ids,
        ) {
            Ok(shortlist) => shortlist,
            Err(_) if !failed_before.is_empty() => self.selector.shortlist(
                &task.requirements,
                &directive.excluded_model_ids,
                &directive.excluded_group_ids,
            )?,
            Err(err) => return Err(err),
        };
        let candidates = shortlist
            .into_iter()
            .map(|model| model.id)
            .collect::<Vec<_>>();
        self.bandit.select_arm(&candidates)
    }

    async fn save_job(&self, directive_id: &str, status: DirectiveStatus, error: Option<String>) {
        let Some(repo) = &self.jobs_repo else {
            return;
        };
        let record = JobRecord {
            id: format!("job-{directive_id}"),
            directive_id: directive_id.to_string(),
            status,
            error,
            updated_at: Utc::now(),
        };
        if let Err(err) = repo.save(record).await {
            tracing::warn!(directive_id = %directive_id, error = %err, "job record not persisted");
        }
    }
}

fn first_failure(task: &Task, event: &TraceEvent) -> DirectiveFailure {
    DirectiveFailure {
        task_id: task.id.clone(),
        error: task.error.clone().unwrap_or_default(),
        trace_event_id: Some(event.id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::{BanditConfig, MemoryRepository, SelectorConfig};
    use crucible_types::ModelDescriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn selector(ids: &[&str]) -> Arc<ModelSelector> {
        let catalog = ids
            .iter()
            .map(|id| ModelDescriptor::new(*id, "p"))
            .collect::<Vec<_>>();
        Arc::new(ModelSelector::new(catalog, SelectorConfig::default()).with_seed(4))
    }

    fn runner(executor: Arc<dyn TaskExecutor>, models: &[&str]) -> DirectiveRunner {
        DirectiveRunner::new(
            EventBus::new(),
            executor,
            selector(models),
            Arc::new(BanditSelector::with_seed(BanditConfig::default(), 2)),
            ActiveRunRegistry::new(),
        )
    }

    fn spec(tasks: &[(&str, bool)]) -> DirectiveSpec {
        let mut spec = DirectiveSpec::new("ship it");
        spec.id = Some("d-1".into());
        for (id, required) in tasks {
            let mut task = TaskSpec::new("coder", format!("do {id}"));
            task.id = Some(id.to_string());
            task.required = *required;
            spec = spec.with_task(task);
        }
        spec
    }

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, attempt: TaskAttempt) -> anyhow::Result<String> {
            Ok(format!("{} via {}", attempt.task.prompt, attempt.model_id))
        }
    }

    /// Fails attempts on one model, succeeds on any other.
    struct FailsOn(&'static str);

    #[async_trait]
    impl TaskExecutor for FailsOn {
        async fn execute(&self, attempt: TaskAttempt) -> anyhow::Result<String> {
            if attempt.model_id == self.0 {
                anyhow::bail!("{} is broken", self.0);
            }
            Ok("ok".into())
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskExecutor for Panics {
        async fn execute(&self, _attempt: TaskAttempt) -> anyhow::Result<String> {
            panic!("executor blew up");
        }
    }

    struct Gauge {
        now: AtomicUsize,
        max: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for Gauge {
        async fn execute(&self, _attempt: TaskAttempt) -> anyhow::Result<String> {
            let current = self.now.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.now.fetch_sub(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    struct Hangs;

    #[async_trait]
    impl TaskExecutor for Hangs {
        async fn execute(&self, _attempt: TaskAttempt) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn all_tasks_succeed_and_events_bracket_the_run() {
        let runner = runner(Arc::new(Echo), &["m-1"]);
        let result = runner.run(spec(&[("a", true), ("b", true)])).await.expect("run");
        assert!(result.succeeded());
        assert_eq!(result.tasks.len(), 2);
        assert!(result
            .tasks
            .iter()
            .all(|t| t.result.as_deref() == Some(&*format!("do {} via m-1", t.id))));

        let history = runner.events().history();
        assert_eq!(history.first().map(|e| e.event_type.as_str()), Some("directive.started"));
        assert_eq!(history.last().map(|e| e.event_type.as_str()), Some("directive.completed"));
        assert_eq!(runner.bandit().arm_stats("m-1").map(|a| a.pulls), Some(2));
    }

    #[tokio::test]
    async fn retries_move_to_another_model() {
        let runner = runner(Arc::new(FailsOn("m-bad")), &["m-bad", "m-good"]);
        let mut spec = spec(&[]);
        for i in 0..4 {
            let mut task = TaskSpec::new("coder", "x");
            task.id = Some(format!("t-{i}"));
            spec = spec.with_task(task);
        }
        let result = runner.run(spec).await.expect("run");
        assert!(result.succeeded());
        assert!(result.tasks.iter().all(|t| t.attempt <= 2));
        assert!(result
            .tasks
            .iter()
            .all(|t| t.model_id.as_deref() == Some("m-good")));
    }

    #[tokio::test]
    async fn optional_task_failure_does_not_fail_directive() {
        let runner = runner(Arc::new(FailsOn("only")), &["only"]);
        let result = runner.run(spec(&[("maybe", false)])).await.expect("run");
        assert!(result.succeeded());
        assert_eq!(result.tasks[0].status, TaskStatus::Failed);
        assert_eq!(result.tasks[0].attempt, 3);
    }

    #[tokio::test]
    async fn selection_exhaustion_fails_the_task_once() {
        let runner = runner(Arc::new(Echo), &["m-1"]);
        let mut spec = spec(&[("a", true)]);
        spec.excluded_model_ids = vec!["m-1".into()];
        let result = runner.run(spec).await.expect("run");
        assert_eq!(result.status, DirectiveStatus::Failed);
        let failure = result.failure.expect("failure");
        assert_eq!(failure.task_id, "a");
        assert_eq!(failure.error, "no active models available");
        assert!(failure.trace_event_id.is_some());
        // One attempt was claimed and it never reached a model.
        assert_eq!(result.tasks[0].attempt, 1);
        let failed = runner.events().events_of(TraceKind::TaskFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].u64_field("attempt"), Some(1));
        assert_eq!(failure.trace_event_id.as_deref(), Some(failed[0].id.as_str()));
    }

    #[tokio::test]
    async fn executor_panic_is_a_task_failure() {
        let runner = runner(Arc::new(Panics), &["m-1"]);
        let result = runner.run(spec(&[("a", true)])).await.expect("run");
        assert_eq!(result.status, DirectiveStatus::Failed);
        assert_eq!(
            result.failure.map(|f| f.error),
            Some("task executor panicked".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallelism_is_bounded() {
        let gauge = Arc::new(Gauge {
            now: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        });
        let runner = runner(gauge.clone(), &["m-1", "m-2"]).with_limits(&OrchestratorConfig {
            max_attempts: 1,
            max_parallel_tasks: 2,
        });
        let tasks = (0..6)
            .map(|i| (format!("t-{i}"), true))
            .collect::<Vec<_>>();
        let refs = tasks
            .iter()
            .map(|(id, req)| (id.as_str(), *req))
            .collect::<Vec<_>>();
        let result = runner.run(spec(&refs)).await.expect("run");
        assert!(result.succeeded());
        assert_eq!(gauge.max.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_fails_in_flight_tasks_and_frees_the_id() {
        let runner = Arc::new(runner(Arc::new(Hangs), &["m-1"]));
        let background = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(spec(&[("slow", true)])).await })
        };
        for _ in 0..100 {
            if runner.cancel("d-1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = tokio::time::timeout(Duration::from_secs(5), background)
            .await
            .expect("cancel is prompt")
            .expect("join")
            .expect("run");
        assert_eq!(result.status, DirectiveStatus::Failed);
        assert_eq!(result.failure.map(|f| f.error), Some(CANCELLED.to_string()));
        assert!(!runner.cancel("d-1").await);
    }

    #[tokio::test]
    async fn planner_fills_in_missing_tasks_and_records_are_persisted() {
        let tasks: Arc<MemoryRepository<Task>> = Arc::new(MemoryRepository::new());
        let jobs: Arc<MemoryRepository<JobRecord>> = Arc::new(MemoryRepository::new());
        let runner = runner(Arc::new(Echo), &["m-1"])
            .with_planner(Arc::new(SingleTaskPlanner::new("writer")))
            .with_task_repository(tasks.clone())
            .with_job_repository(jobs.clone());
        let mut directive = DirectiveSpec::new("write the changelog");
        directive.id = Some("d-9".into());
        let result = runner.run(directive).await.expect("run");
        assert!(result.succeeded());
        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].role, "writer");

        let saved = tasks.list().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, TaskStatus::Succeeded);
        let job = jobs.find("job-d-9").await.expect("find").expect("job");
        assert_eq!(job.status, DirectiveStatus::Succeeded);
    }
}
