use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crucible_core::{ActiveRunRegistry, BanditConfig, EventBus, OrchestratorConfig, SelectorConfig};
use crucible_observability::{read_trace_log, TraceLog};
use crucible_orchestrator::{
    BanditSelector, DirectiveRunner, ModelSelector, TaskAttempt, TaskExecutor,
};
use crucible_types::{DirectiveSpec, DirectiveStatus, ModelDescriptor, TaskSpec, TaskStatus};
use tempfile::TempDir;

/// Succeeds for every task except `task-2`.
struct SecondTaskAlwaysFails {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for SecondTaskAlwaysFails {
    async fn execute(&self, attempt: TaskAttempt) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt.task.id == "task-2" {
            anyhow::bail!("attempt {} of task-2 failed", attempt.task.attempt);
        }
        Ok(format!("{} finished", attempt.task.id))
    }
}

fn two_task_directive() -> DirectiveSpec {
    let mut first = TaskSpec::new("coder", "write the parser");
    first.id = Some("task-1".to_string());
    let mut second = TaskSpec::new("coder", "write the printer");
    second.id = Some("task-2".to_string());
    let mut spec = DirectiveSpec::new("ship the formatter")
        .with_task(first)
        .with_task(second);
    spec.id = Some("directive-a".to_string());
    spec
}

#[tokio::test]
async fn test_required_task_exhausting_retries_fails_directive() {
    let temp_dir = TempDir::new().unwrap();
    let trace_path = temp_dir.path().join("trace.jsonl");
    let events = EventBus::with_trace_log(Arc::new(TraceLog::open(&trace_path).unwrap()));

    let executor = Arc::new(SecondTaskAlwaysFails {
        calls: AtomicUsize::new(0),
    });
    let selector = Arc::new(ModelSelector::new(
        vec![ModelDescriptor::new("model-a", "local"), ModelDescriptor::new("model-b", "local")],
        SelectorConfig::default(),
    ));
    let runner = DirectiveRunner::new(
        events,
        executor.clone(),
        selector,
        Arc::new(BanditSelector::new(BanditConfig::default())),
        ActiveRunRegistry::new(),
    )
    .with_limits(&OrchestratorConfig {
        max_attempts: 3,
        max_parallel_tasks: 2,
    });

    let result = runner.run(two_task_directive()).await.unwrap();

    assert_eq!(result.status, DirectiveStatus::Failed);
    let first = result.tasks.iter().find(|t| t.id == "task-1").unwrap();
    assert_eq!(first.status, TaskStatus::Succeeded);
    let second = result.tasks.iter().find(|t| t.id == "task-2").unwrap();
    assert_eq!(second.status, TaskStatus::Failed);
    assert_eq!(second.attempt, 3);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 4);

    let failure = result.failure.unwrap();
    assert_eq!(failure.task_id, "task-2");
    assert_eq!(failure.error, "attempt 3 of task-2 failed");

    let trace = read_trace_log(&trace_path).unwrap();
    let final_failures = trace
        .iter()
        .filter(|e| e.event_type == "task.failed")
        .filter(|e| e.str_field("taskID") == Some("task-2"))
        .filter(|e| e.u64_field("attempt") == Some(3))
        .collect::<Vec<_>>();
    assert_eq!(final_failures.len(), 1);
    assert_eq!(
        failure.trace_event_id.as_deref(),
        Some(final_failures[0].id.as_str())
    );

    assert_eq!(trace.first().unwrap().event_type, "directive.started");
    let completed = trace.last().unwrap();
    assert_eq!(completed.event_type, "directive.completed");
    assert_eq!(completed.str_field("status"), Some("failed"));
    assert_eq!(completed.str_field("failedTaskID"), Some("task-2"));
}

#[tokio::test]
async fn test_trace_log_keeps_causal_order_per_task() {
    let temp_dir = TempDir::new().unwrap();
    let trace_path = temp_dir.path().join("trace.jsonl");
    let events = EventBus::with_trace_log(Arc::new(TraceLog::open(&trace_path).unwrap()));
    let runner = DirectiveRunner::new(
        events,
        Arc::new(SecondTaskAlwaysFails {
            calls: AtomicUsize::new(0),
        }),
        Arc::new(ModelSelector::new(
            vec![ModelDescriptor::new("model-a", "local")],
            SelectorConfig::default(),
        )),
        Arc::new(BanditSelector::new(BanditConfig::default())),
        ActiveRunRegistry::new(),
    );
    runner.run(two_task_directive()).await.unwrap();

    let trace = read_trace_log(&trace_path).unwrap();
    let seqs = trace.iter().map(|e| e.seq).collect::<Vec<_>>();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let task_two = trace
        .iter()
        .filter(|e| e.str_field("taskID") == Some("task-2"))
        .map(|e| e.event_type.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        task_two,
        vec![
            "task.queued",
            "task.started",
            "task.failed",
            "task.retried",
            "task.started",
            "task.failed",
            "task.retried",
            "task.started",
            "task.failed",
        ]
    );
}
