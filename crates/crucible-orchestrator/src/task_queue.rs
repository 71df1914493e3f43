use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;

use crucible_core::EventBus;
use crucible_types::{Task, TaskStatus, TraceEvent, TraceKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("unknown task `{0}`")]
    UnknownTask(String),

    #[error("task `{task_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Put back on the queue for another attempt.
    Retrying(Task),
    /// Attempt budget spent or the failure cannot be retried. `event` is the
    /// terminal `task.failed` record; its `seq` is stamped when published.
    Terminal { task: Task, event: TraceEvent },
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    ready: VecDeque<String>,
    /// Events recorded with their transition, waiting to be published.
    outbox: Vec<TraceEvent>,
}

impl QueueState {
    fn record(&mut self, kind: TraceKind, payload: serde_json::Value) -> TraceEvent {
        let event = TraceEvent::new(kind, payload);
        self.outbox.push(event.clone());
        event
    }
}

/// Owns task state and is the only place it changes. All transitions happen
/// under one lock, so a dequeued task has exactly one owner until it is
/// completed or failed.
///
/// Each transition queues its trace event in the same critical section and
/// the event is published after the state lock is released. Publishing
/// drains the outbox in order under its own lock, so the bus still sees
/// transitions in the order they happened.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    publishing: Mutex<()>,
    events: EventBus,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(events: EventBus, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            publishing: Mutex::new(()),
            events,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Publishes every recorded event. Returns once the caller's own events
    /// are on the bus, even if another thread picked them up.
    fn flush(&self) {
        let _publishing = self.publishing.lock();
        let pending = std::mem::take(&mut self.state.lock().outbox);
        for event in pending {
            self.events.publish(event);
        }
    }

    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if task.status != TaskStatus::Queued {
            return Err(QueueError::InvalidTransition {
                task_id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Queued,
            });
        }
        {
            let mut state = self.state.lock();
            if state.tasks.contains_key(&task.id) {
                return Err(QueueError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: TaskStatus::Queued,
                    to: TaskStatus::Queued,
                });
            }
            state.record(
                TraceKind::TaskQueued,
                json!({
                    "taskID": task.id,
                    "directiveID": task.directive_id,
                    "role": task.role,
                    "attempt": task.attempt,
                }),
            );
            state.order.push(task.id.clone());
            state.ready.push_back(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
        }
        self.flush();
        Ok(())
    }

    /// Claims the next queued task, moving it to `running` and bumping its
    /// attempt counter.
    pub fn dequeue(&self) -> Option<Task> {
        let claimed = {
            let mut state = self.state.lock();
            let mut claimed = None;
            while let Some(id) = state.ready.pop_front() {
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if task.status != TaskStatus::Queued {
                    continue;
                }
                task.status = TaskStatus::Running;
                task.attempt += 1;
                task.error = None;
                let task = task.clone();
                state.record(
                    TraceKind::TaskStarted,
                    json!({
                        "taskID": task.id,
                        "directiveID": task.directive_id,
                        "attempt": task.attempt,
                    }),
                );
                claimed = Some(task);
                break;
            }
            claimed
        };
        if claimed.is_some() {
            self.flush();
        }
        claimed
    }

    pub fn assign_model(&self, task_id: &str, model_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))?;
        task.model_id = Some(model_id.to_string());
        Ok(())
    }

    pub fn complete(&self, task_id: &str, result: String) -> Result<Task, QueueError> {
        let completed = {
            let mut state = self.state.lock();
            let task = running_task(&mut state, task_id, TaskStatus::Succeeded)?;
            task.status = TaskStatus::Succeeded;
            task.result = Some(result);
            let task = task.clone();
            state.record(
                TraceKind::TaskCompleted,
                json!({
                    "taskID": task.id,
                    "directiveID": task.directive_id,
                    "attempt": task.attempt,
                    "modelID": task.model_id,
                }),
            );
            task
        };
        self.flush();
        Ok(completed)
    }

    /// Records a failed attempt. Retries while the attempt budget lasts.
    pub fn fail(&self, task_id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let outcome = self.fail_inner(task_id, error, false)?;
        self.flush();
        Ok(outcome)
    }

    /// Fails without retrying, for errors a retry cannot fix. The attempt
    /// counter keeps the number of attempts actually made.
    pub fn fail_terminal(&self, task_id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let outcome = self.fail_inner(task_id, error, true)?;
        self.flush();
        Ok(outcome)
    }

    fn fail_inner(
        &self,
        task_id: &str,
        error: &str,
        force_terminal: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut state = self.state.lock();
        let max_attempts = self.max_attempts;
        let task = running_task(&mut state, task_id, TaskStatus::Failed)?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        let terminal = force_terminal || task.attempt >= max_attempts;
        if !terminal {
            task.status = TaskStatus::Queued;
        }
        let task = task.clone();
        let event = state.record(
            TraceKind::TaskFailed,
            json!({
                "taskID": task.id,
                "directiveID": task.directive_id,
                "attempt": task.attempt,
                "modelID": task.model_id,
                "terminal": terminal,
                "error": error,
            }),
        );
        if terminal {
            return Ok(FailOutcome::Terminal { task, event });
        }

        state.record(
            TraceKind::TaskRetried,
            json!({
                "taskID": task.id,
                "directiveID": task.directive_id,
                "attempt": task.attempt,
                "nextAttempt": task.attempt + 1,
            }),
        );
        state.ready.push_back(task_id.to_string());
        Ok(FailOutcome::Retrying(task))
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    /// Tasks in enqueue order.
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub fn has_ready(&self) -> bool {
        let state = self.state.lock();
        state
            .ready
            .iter()
            .any(|id| state.tasks.get(id).is_some_and(|t| t.status == TaskStatus::Queued))
    }

    pub fn running_ids(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.status == TaskStatus::Running)
            })
            .cloned()
            .collect()
    }

    /// Removes every task of a finished directive and returns them in
    /// enqueue order.
    pub fn archive(&self, directive_id: &str) -> Vec<Task> {
        let mut state = self.state.lock();
        let ids = state
            .order
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.directive_id == directive_id)
            })
            .cloned()
            .collect::<Vec<_>>();
        state.order.retain(|id| !ids.contains(id));
        state.ready.retain(|id| !ids.contains(id));
        ids.iter()
            .filter_map(|id| state.tasks.remove(id))
            .collect()
    }
}

fn running_task<'a>(
    state: &'a mut QueueState,
    task_id: &str,
    to: TaskStatus,
) -> Result<&'a mut Task, QueueError> {
    let task = state
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))?;
    if !task.status.can_transition_to(to) {
        return Err(QueueError::InvalidTransition {
            task_id: task_id.to_string(),
            from: task.status,
            to,
        });
    }
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_types::TaskSpec;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn task(id: &str) -> Task {
        let mut spec = TaskSpec::new("coder", "do it");
        spec.id = Some(id.to_string());
        Task::from_spec("d-1", spec)
    }

    #[test]
    fn retries_until_budget_then_terminal() {
        let bus = EventBus::new();
        let queue = TaskQueue::new(bus.clone(), 3);
        queue.enqueue(task("t-1")).expect("enqueue");

        for attempt in 1..=3u32 {
            let running = queue.dequeue().expect("task");
            assert_eq!(running.attempt, attempt);
            match queue.fail("t-1", "boom").expect("fail") {
                FailOutcome::Retrying(t) => {
                    assert!(attempt < 3);
                    assert_eq!(t.status, TaskStatus::Queued);
                }
                FailOutcome::Terminal { task, event } => {
                    assert_eq!(attempt, 3);
                    assert!(task.is_terminal());
                    assert_eq!(event.u64_field("attempt"), Some(3));
                }
            }
        }
        assert!(queue.dequeue().is_none());

        let failed = bus.events_of(TraceKind::TaskFailed);
        assert_eq!(failed.len(), 3);
        let attempts = failed
            .iter()
            .filter_map(|e| e.u64_field("attempt"))
            .collect::<Vec<_>>();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(bus.events_of(TraceKind::TaskRetried).len(), 2);
    }

    #[test]
    fn terminal_failure_keeps_the_real_attempt_count() {
        let bus = EventBus::new();
        let queue = TaskQueue::new(bus.clone(), 3);
        queue.enqueue(task("t-1")).expect("enqueue");
        let running = queue.dequeue().expect("task");
        assert_eq!(running.attempt, 1);

        let FailOutcome::Terminal { task, event } =
            queue.fail_terminal("t-1", "no model").expect("fail")
        else {
            panic!("forced failure must be terminal");
        };
        assert_eq!(task.attempt, 1);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.is_terminal());
        assert_eq!(event.u64_field("attempt"), Some(1));
        assert_eq!(queue.get("t-1").map(|t| t.attempt), Some(1));
        assert!(queue.dequeue().is_none());
        assert!(bus.events_of(TraceKind::TaskRetried).is_empty());
    }

    #[test]
    fn state_lock_is_free_while_events_publish() {
        let bus = EventBus::new();
        let queue = Arc::new(TaskQueue::new(bus.clone(), 3));
        let publishing = queue.publishing.lock();

        let writer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.enqueue(task("t-1")))
        };
        // The transition lands and other callers can read state while the
        // event is still waiting to publish.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while queue.get("t-1").is_none() {
            assert!(std::time::Instant::now() < deadline, "enqueue never released the state lock");
            std::thread::yield_now();
        }
        assert!(queue.has_ready());
        assert!(bus.history().is_empty());

        drop(publishing);
        writer.join().expect("join").expect("enqueue");
        assert_eq!(bus.events_of(TraceKind::TaskQueued).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_transitions_publish_in_causal_order() {
        let bus = EventBus::new();
        let queue = Arc::new(TaskQueue::new(bus.clone(), 2));
        for i in 0..100 {
            queue.enqueue(task(&format!("t-{i}"))).expect("enqueue");
        }
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let queue = queue.clone();
            set.spawn(async move {
                while let Some(task) = queue.dequeue() {
                    tokio::task::yield_now().await;
                    if task.attempt == 1 {
                        queue.fail(&task.id, "flaky").expect("fail");
                    } else {
                        queue.complete(&task.id, "ok".into()).expect("complete");
                    }
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            joined.expect("worker");
        }

        let history = bus.history();
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
        for i in 0..100 {
            let id = format!("t-{i}");
            let kinds = history
                .iter()
                .filter(|e| e.payload.get("taskID").and_then(|v| v.as_str()) == Some(id.as_str()))
                .map(|e| e.event_type.as_str())
                .collect::<Vec<_>>();
            assert_eq!(
                kinds,
                vec![
                    "task.queued",
                    "task.started",
                    "task.failed",
                    "task.retried",
                    "task.started",
                    "task.completed"
                ],
                "{id}"
            );
        }
    }

    #[test]
    fn finished_tasks_never_run_again() {
        let queue = TaskQueue::new(EventBus::new(), 1);
        queue.enqueue(task("ok")).expect("enqueue");
        queue.enqueue(task("bad")).expect("enqueue");

        let first = queue.dequeue().expect("first");
        queue.complete(&first.id, "done".into()).expect("complete");
        let second = queue.dequeue().expect("second");
        assert!(matches!(
            queue.fail(&second.id, "x").expect("fail"),
            FailOutcome::Terminal { .. }
        ));

        assert!(queue.dequeue().is_none());
        assert!(matches!(
            queue.complete("ok", "again".into()),
            Err(QueueError::InvalidTransition { from: TaskStatus::Succeeded, .. })
        ));
        assert!(matches!(
            queue.fail("bad", "again"),
            Err(QueueError::InvalidTransition { from: TaskStatus::Failed, .. })
        ));
        assert_eq!(queue.get("ok").map(|t| t.status), Some(TaskStatus::Succeeded));
        assert_eq!(queue.get("bad").map(|t| t.status), Some(TaskStatus::Failed));
        assert!(matches!(
            queue.complete("nope", String::new()),
            Err(QueueError::UnknownTask(id)) if id == "nope"
        ));
    }

    #[test]
    fn trace_events_follow_causal_order() {
        let bus = EventBus::new();
        let queue = TaskQueue::new(bus.clone(), 2);
        queue.enqueue(task("t")).expect("enqueue");
        let t = queue.dequeue().expect("task");
        queue.fail(&t.id, "flaky").expect("fail");
        let t = queue.dequeue().expect("retry");
        queue.complete(&t.id, "ok".into()).expect("complete");

        let kinds = bus
            .history()
            .iter()
            .map(|e| e.event_type.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "task.queued",
                "task.started",
                "task.failed",
                "task.retried",
                "task.started",
                "task.completed"
            ]
        );
        let seqs = bus.history().iter().map(|e| e.seq).collect::<Vec<_>>();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn archive_removes_only_that_directive() {
        let queue = TaskQueue::new(EventBus::new(), 3);
        queue.enqueue(task("a")).expect("a");
        let mut other = TaskSpec::new("r", "p");
        other.id = Some("b".into());
        queue.enqueue(Task::from_spec("d-2", other)).expect("b");

        let archived = queue.archive("d-1");
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, "a");
        assert_eq!(queue.tasks().len(), 1);
        assert_eq!(queue.dequeue().map(|t| t.id), Some("b".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_dequeue_hands_each_task_to_one_worker() {
        let queue = Arc::new(TaskQueue::new(EventBus::new(), 3));
        for i in 0..200 {
            queue.enqueue(task(&format!("t-{i}"))).expect("enqueue");
        }
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let queue = queue.clone();
            set.spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = queue.dequeue() {
                    mine.push(task.id);
                    tokio::task::yield_now().await;
                }
                mine
            });
        }
        let mut seen = HashSet::new();
        let mut total = 0;
        while let Some(joined) = set.join_next().await {
            for id in joined.expect("worker") {
                total += 1;
                seen.insert(id);
            }
        }
        assert_eq!(total, 200);
        assert_eq!(seen.len(), 200);
        assert!(queue.tasks().iter().all(|t| t.attempt == 1));
    }
}
