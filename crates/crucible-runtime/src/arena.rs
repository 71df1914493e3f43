use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::Level;

use crucible_core::{ArenaBackendKind, ArenaConfig};
use crucible_observability::{emit_event, EngineEvent};
use crucible_tools::{list_workspace_files, SafeCodeInterpreter, ToolContext, ToolRegistry};

use crate::backend::{GitWorktreeBackend, ScratchBackend, WorkspaceBackend};
use crate::{AgentContext, AgentOutput, AgentRunner, ArenaError, IsolationHandle};

const BRANCH_PREFIX: &str = "crucible";
const NONCE_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct ArenaRequest {
    pub task_id: String,
    pub variant_id: String,
    pub task_prompt: String,
    pub system_prompt: String,
}

impl ArenaRequest {
    pub fn new(
        task_id: impl Into<String>,
        variant_id: impl Into<String>,
        task_prompt: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            variant_id: variant_id.into(),
            task_prompt: task_prompt.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Result of one arena run. Agent failures are data here: `exit_code` is 1
/// and `error` is set, but the workspace is left in place for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaRun {
    pub handle: IsolationHandle,
    pub output: String,
    pub logs: Vec<String>,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub duration_ms: u64,
}

impl ArenaRun {
    pub fn handle_path(&self) -> &Path {
        &self.handle.path
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    AlreadyClean,
    Refused,
}

pub struct IsolationArena {
    root: PathBuf,
    base_ref: String,
    backend: Arc<dyn WorkspaceBackend>,
    tools: ToolRegistry,
    agent_timeout: Duration,
    commit_on_success: bool,
    // Serializes create/remove/commit against the shared repository metadata.
    repo_lock: Mutex<()>,
    active: parking_lot::Mutex<HashMap<PathBuf, IsolationHandle>>,
}

impl IsolationArena {
    pub fn new(
        root: impl Into<PathBuf>,
        backend: Arc<dyn WorkspaceBackend>,
        tools: ToolRegistry,
    ) -> Self {
        let defaults = ArenaConfig::default();
        Self {
            root: root.into(),
            base_ref: defaults.base_ref,
            backend,
            tools,
            agent_timeout: Duration::from_secs(defaults.agent_timeout_secs),
            commit_on_success: defaults.commit_on_success,
            repo_lock: Mutex::new(()),
            active: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Builds an arena from config. The isolation root defaults to
    /// `<state_dir>/arena`; the git backend defaults to the current directory.
    pub fn from_config(
        config: &ArenaConfig,
        state_dir: &Path,
        tools: ToolRegistry,
    ) -> anyhow::Result<Self> {
        let root = config
            .root
            .clone()
            .unwrap_or_else(|| state_dir.join("arena"));
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let backend: Arc<dyn WorkspaceBackend> = match config.backend {
            ArenaBackendKind::Git => {
                let repo = match &config.repo_path {
                    Some(path) => path.clone(),
                    None => std::env::current_dir()?,
                };
                Arc::new(GitWorktreeBackend::new(repo))
            }
            ArenaBackendKind::Scratch => match &config.repo_path {
                Some(seed) => Arc::new(ScratchBackend::seeded_from(seed)),
                None => Arc::new(ScratchBackend::new()),
            },
        };
        Ok(Self::new(root, backend, tools)
            .with_base_ref(config.base_ref.clone())
            .with_agent_timeout(Duration::from_secs(config.agent_timeout_secs))
            .with_commit_on_success(config.commit_on_success))
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = base_ref.into();
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_commit_on_success(mut self, enabled: bool) -> Self {
        self.commit_on_success = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn active_handles(&self) -> Vec<IsolationHandle> {
        let mut handles = self.active.lock().values().cloned().collect::<Vec<_>>();
        handles.sort_by(|a, b| a.path.cmp(&b.path));
        handles
    }

    /// Creates a fresh workspace, runs the agent inside it and captures the
    /// outcome. Only workspace setup can fail; everything after is recorded
    /// in the returned [`ArenaRun`]. The workspace is not cleaned up.
    pub async fn run(
        &self,
        request: ArenaRequest,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<ArenaRun, ArenaError> {
        let handle = self.allocate(&request);
        // Registered before setup so a run dropped mid-setup is still found
        // by `active_handles` and can be cleaned up.
        self.active.lock().insert(handle.path.clone(), handle.clone());
        if let Err(err) = self.create_workspace(&handle).await {
            self.active.lock().remove(&handle.path);
            return Err(err);
        }
        tracing::info!(
            task_id = %handle.task_id,
            variant_id = %handle.variant_id,
            path = %handle.path.display(),
            backend = self.backend.name(),
            "isolated workspace ready"
        );

        let ctx = AgentContext {
            task_id: request.task_id.clone(),
            variant_id: request.variant_id.clone(),
            workspace_root: handle.path.clone(),
            task_prompt: request.task_prompt,
            system_prompt: request.system_prompt,
            tools: ToolContext::new(handle.path.clone()),
            interpreter: SafeCodeInterpreter::new(self.tools.clone()),
        };

        let started = Instant::now();
        let (exit_code, output, error) = self.drive(runner, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let artifacts = {
            let path = handle.path.clone();
            tokio::task::spawn_blocking(move || list_workspace_files(&path))
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "artifact scan failed");
                    Vec::new()
                })
        };

        let mut logs = output.logs;
        let mut commit = None;
        if exit_code == 0 && self.commit_on_success {
            let _guard = self.repo_lock.lock().await;
            let message = format!("crucible: {} ({})", handle.task_id, handle.variant_id);
            match self.backend.commit(&handle.path, &message).await {
                Ok(rev) => commit = rev,
                Err(err) => {
                    tracing::warn!(path = %handle.path.display(), error = %err, "commit failed");
                    logs.push(format!("commit failed: {err:#}"));
                }
            }
        }

        let status = if exit_code == 0 { "succeeded" } else { "failed" };
        emit_event(
            if exit_code == 0 { Level::INFO } else { Level::WARN },
            EngineEvent {
                event: "arena.run.finished",
                component: "arena",
                task_id: Some(&handle.task_id),
                variant_id: Some(&handle.variant_id),
                status: Some(status),
                untrusted: error.as_deref(),
                ..Default::default()
            },
        );

        Ok(ArenaRun {
            handle,
            output: output.output,
            logs,
            exit_code,
            error,
            artifacts,
            commit,
            duration_ms,
        })
    }

    async fn drive(
        &self,
        runner: Arc<dyn AgentRunner>,
        ctx: AgentContext,
    ) -> (i32, AgentOutput, Option<String>) {
        let mut join = tokio::spawn(async move { runner.run(ctx).await });
        // Dropping the run (e.g. a cancelled race) must not leave the agent
        // working in a workspace that is about to be removed.
        let _abort = AbortOnDrop(join.abort_handle());
        match tokio::time::timeout(self.agent_timeout, &mut join).await {
            Ok(Ok(Ok(output))) => (0, output, None),
            Ok(Ok(Err(err))) => (1, AgentOutput::default(), Some(format!("{err:#}"))),
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                (
                    1,
                    AgentOutput::default(),
                    Some(format!("agent loop panicked: {message}")),
                )
            }
            Err(_) => {
                join.abort();
                (
                    1,
                    AgentOutput::default(),
                    Some(format!("agent loop timed out after {:?}", self.agent_timeout)),
                )
            }
        }
    }

    fn allocate(&self, request: &ArenaRequest) -> IsolationHandle {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let nonce = &nonce[..NONCE_LEN];
        let task = sanitize(&request.task_id);
        let variant = sanitize(&request.variant_id);
        IsolationHandle {
            path: self.root.join(format!("{task}-{variant}-{nonce}")),
            branch_name: format!("{BRANCH_PREFIX}/{task}/{variant}-{nonce}"),
            task_id: request.task_id.clone(),
            variant_id: request.variant_id.clone(),
        }
    }

    async fn create_workspace(&self, handle: &IsolationHandle) -> Result<(), ArenaError> {
        let setup_err = |message: String| ArenaError::IsolationSetup {
            task_id: handle.task_id.clone(),
            message,
        };
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| setup_err(format!("cannot create isolation root: {err}")))?;

        let _guard = self.repo_lock.lock().await;
        let created = self
            .backend
            .create(&handle.path, &handle.branch_name, &self.base_ref)
            .await;
        if let Err(err) = created {
            if let Err(cleanup_err) = self
                .backend
                .remove(&handle.path, Some(&handle.branch_name))
                .await
            {
                tracing::debug!(error = %cleanup_err, "partial workspace removal reported an error");
            }
            if handle.path.exists() {
                if let Err(rm_err) = tokio::fs::remove_dir_all(&handle.path).await {
                    tracing::warn!(path = %handle.path.display(), error = %rm_err, "could not remove partial workspace");
                }
            }
            return Err(setup_err(format!("{err:#}")));
        }
        Ok(())
    }

    /// Removes a workspace created by this arena. Safe to call repeatedly;
    /// paths outside the isolation root are refused and left untouched.
    /// Failures are logged, never returned.
    pub async fn cleanup(&self, path: &Path) -> CleanupOutcome {
        if let Err(err) = self.ensure_inside_root(path) {
            tracing::warn!(error = %err, "refusing cleanup");
            return CleanupOutcome::Refused;
        }

        let _guard = self.repo_lock.lock().await;
        let handle = self.active.lock().remove(path);
        if handle.is_none() && !path.exists() {
            return CleanupOutcome::AlreadyClean;
        }
        let branch = match handle {
            Some(handle) => Some(handle.branch_name),
            None => self.orphan_branch(path).await,
        };
        if let Err(err) = self.backend.remove(path, branch.as_deref()).await {
            tracing::warn!(path = %path.display(), error = %err, "workspace removal reported an error");
        }
        if path.exists() {
            if let Err(err) = tokio::fs::remove_dir_all(path).await {
                tracing::warn!(path = %path.display(), error = %err, "workspace directory left behind");
            }
        }
        tracing::debug!(path = %path.display(), "workspace cleaned up");
        CleanupOutcome::Removed
    }

    /// Finds the branch of a workspace this arena no longer tracks (e.g.
    /// left over from an earlier process) by the nonce in its directory name.
    async fn orphan_branch(&self, path: &Path) -> Option<String> {
        let nonce = workspace_nonce(path)?;
        let pattern = format!("{BRANCH_PREFIX}/*/*-{nonce}");
        match self.backend.branches_matching(&pattern).await {
            Ok(mut branches) => {
                if branches.len() > 1 {
                    tracing::warn!(path = %path.display(), ?branches, "several branches match workspace");
                }
                branches.pop()
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not look up workspace branch");
                None
            }
        }
    }

    fn ensure_inside_root(&self, path: &Path) -> Result<(), ArenaError> {
        let outside = || ArenaError::OutsideRoot(path.to_path_buf());
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(outside());
        }
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.components().count() == 1 => {}
            _ => return Err(outside()),
        }
        if let (Ok(root), Ok(real)) = (self.root.canonicalize(), path.canonicalize()) {
            if real.parent() != Some(root.as_path()) {
                return Err(outside());
            }
        }
        Ok(())
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The trailing 8-hex-digit nonce of a workspace directory name.
fn workspace_nonce(path: &Path) -> Option<&str> {
    let (_, nonce) = path.file_name()?.to_str()?.rsplit_once('-')?;
    (nonce.len() == NONCE_LEN && nonce.chars().all(|c| c.is_ascii_hexdigit())).then_some(nonce)
}

fn sanitize(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(48)
        .collect::<String>();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct WritesReport;

    #[async_trait]
    impl AgentRunner for WritesReport {
        async fn run(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
            let outcomes = ctx
                .interpreter
                .extract_and_run(
                    "```js\nawait callTool('write_file', {path: 'out/report.md', content: 'ok'})\n```",
                    &ctx.tools,
                )
                .await?;
            anyhow::ensure!(outcomes.iter().all(|o| o.is_ok()), "tool failed");
            Ok(AgentOutput {
                output: format!("done: {}", ctx.task_prompt),
                logs: vec!["wrote report".to_string()],
            })
        }
    }

    struct Fails;

    #[async_trait]
    impl AgentRunner for Fails {
        async fn run(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
            tokio::fs::write(ctx.workspace_root.join("partial.txt"), "half").await?;
            anyhow::bail!("model refused")
        }
    }

    struct Panics;

    #[async_trait]
    impl AgentRunner for Panics {
        async fn run(&self, _ctx: AgentContext) -> anyhow::Result<AgentOutput> {
            panic!("agent blew up");
        }
    }

    struct Sleeps;

    #[async_trait]
    impl AgentRunner for Sleeps {
        async fn run(&self, _ctx: AgentContext) -> anyhow::Result<AgentOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentOutput::text("late"))
        }
    }

    struct BrokenBackend {
        removes: AtomicUsize,
    }

    #[async_trait]
    impl WorkspaceBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn create(&self, path: &Path, _branch: &str, _base_ref: &str) -> anyhow::Result<()> {
            tokio::fs::create_dir_all(path).await?;
            tokio::fs::write(path.join("half-made"), "x").await?;
            anyhow::bail!("checkout failed")
        }

        async fn remove(&self, _path: &Path, _branch: Option<&str>) -> anyhow::Result<()> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn commit(&self, _path: &Path, _message: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    /// Scratch directories plus an in-memory branch list, recording which
    /// branch each removal was asked to delete.
    #[derive(Default)]
    struct BranchBackend {
        branches: parking_lot::Mutex<Vec<String>>,
        removed: parking_lot::Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl WorkspaceBackend for BranchBackend {
        fn name(&self) -> &'static str {
            "branches"
        }

        async fn create(&self, path: &Path, branch: &str, _base_ref: &str) -> anyhow::Result<()> {
            tokio::fs::create_dir_all(path).await?;
            self.branches.lock().push(branch.to_string());
            Ok(())
        }

        async fn remove(&self, path: &Path, branch: Option<&str>) -> anyhow::Result<()> {
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
            if let Some(branch) = branch {
                self.branches.lock().retain(|b| b != branch);
            }
            self.removed.lock().push(branch.map(str::to_string));
            Ok(())
        }

        async fn commit(&self, _path: &Path, _message: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        async fn branches_matching(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
            let suffix = pattern.rsplit_once('*').map(|(_, s)| s).unwrap_or(pattern);
            Ok(self
                .branches
                .lock()
                .iter()
                .filter(|b| b.starts_with("crucible/") && b.ends_with(suffix))
                .cloned()
                .collect())
        }
    }

    struct Counts(Arc<AtomicUsize>);

    #[async_trait]
    impl AgentRunner for Counts {
        async fn run(&self, _ctx: AgentContext) -> anyhow::Result<AgentOutput> {
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            Ok(AgentOutput::text("counted"))
        }
    }

    fn arena(root: &Path) -> IsolationArena {
        IsolationArena::new(
            root.join("arena"),
            Arc::new(ScratchBackend::new()),
            ToolRegistry::with_builtin_tools(),
        )
    }

    #[tokio::test]
    async fn run_captures_output_and_artifacts_and_keeps_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = arena(dir.path());
        let run = arena
            .run(
                ArenaRequest::new("task/1", "baseline", "summarize", "be brief"),
                Arc::new(WritesReport),
            )
            .await
            .expect("run");

        assert_eq!(run.exit_code, 0);
        assert_eq!(run.output, "done: summarize");
        assert_eq!(run.logs, vec!["wrote report".to_string()]);
        assert_eq!(run.artifacts, vec!["out/report.md".to_string()]);
        assert!(run.handle_path().join("out/report.md").exists());
        assert!(run.handle.branch_name.starts_with("crucible/task-1/baseline-"));
        assert_eq!(arena.active_handles(), vec![run.handle.clone()]);
    }

    #[tokio::test]
    async fn agent_errors_and_panics_become_failed_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = arena(dir.path());

        let failed = arena
            .run(ArenaRequest::new("t", "v", "p", "s"), Arc::new(Fails))
            .await
            .expect("setup ok");
        assert_eq!(failed.exit_code, 1);
        assert_eq!(failed.error.as_deref(), Some("model refused"));
        assert_eq!(failed.artifacts, vec!["partial.txt".to_string()]);
        assert!(failed.handle_path().exists());

        let panicked = arena
            .run(ArenaRequest::new("t", "v", "p", "s"), Arc::new(Panics))
            .await
            .expect("setup ok");
        assert_eq!(panicked.exit_code, 1);
        assert!(panicked
            .error
            .as_deref()
            .is_some_and(|e| e.contains("agent blew up")));
        assert_ne!(failed.handle.path, panicked.handle.path);
    }

    #[tokio::test]
    async fn agent_timeout_is_captured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = arena(dir.path()).with_agent_timeout(Duration::from_millis(50));
        let run = arena
            .run(ArenaRequest::new("t", "v", "p", "s"), Arc::new(Sleeps))
            .await
            .expect("setup ok");
        assert_eq!(run.exit_code, 1);
        assert!(run.error.as_deref().is_some_and(|e| e.contains("timed out")));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_refuses_foreign_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = arena(dir.path());
        let run = arena
            .run(ArenaRequest::new("t", "v", "p", "s"), Arc::new(WritesReport))
            .await
            .expect("run");

        let bystander = dir.path().join("bystander");
        std::fs::create_dir_all(&bystander).expect("bystander");

        assert_eq!(arena.cleanup(run.handle_path()).await, CleanupOutcome::Removed);
        assert!(!run.handle_path().exists());
        assert_eq!(
            arena.cleanup(run.handle_path()).await,
            CleanupOutcome::AlreadyClean
        );
        assert!(arena.active_handles().is_empty());

        for foreign in [
            bystander.clone(),
            arena.root().to_path_buf(),
            arena.root().join("..").join("bystander"),
            PathBuf::from("/tmp"),
        ] {
            assert_eq!(arena.cleanup(&foreign).await, CleanupOutcome::Refused);
        }
        assert!(bystander.exists());
        assert!(arena.root().exists());
    }

    #[tokio::test]
    async fn setup_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(BrokenBackend {
            removes: AtomicUsize::new(0),
        });
        let arena = IsolationArena::new(
            dir.path().join("arena"),
            backend.clone(),
            ToolRegistry::new(),
        );
        let err = arena
            .run(ArenaRequest::new("t-9", "v", "p", "s"), Arc::new(WritesReport))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::IsolationSetup { ref task_id, .. } if task_id == "t-9"));
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
        assert!(arena.active_handles().is_empty());
        let leftovers = std::fs::read_dir(arena.root()).expect("root").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn cleanup_of_an_untracked_workspace_still_deletes_its_branch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(BranchBackend::default());
        let first = IsolationArena::new(
            dir.path().join("arena"),
            backend.clone(),
            ToolRegistry::with_builtin_tools(),
        );
        let run = first
            .run(ArenaRequest::new("t", "v", "p", "s"), Arc::new(WritesReport))
            .await
            .expect("run");
        let other = first
            .run(ArenaRequest::new("t", "w", "p", "s"), Arc::new(WritesReport))
            .await
            .expect("run");
        assert_eq!(backend.branches.lock().len(), 2);

        // A fresh arena over the same root knows nothing about either run.
        let restarted = IsolationArena::new(
            dir.path().join("arena"),
            backend.clone(),
            ToolRegistry::with_builtin_tools(),
        );
        assert!(restarted.active_handles().is_empty());
        assert_eq!(restarted.cleanup(run.handle_path()).await, CleanupOutcome::Removed);

        assert!(!run.handle_path().exists());
        assert_eq!(
            backend.removed.lock().clone(),
            vec![Some(run.handle.branch_name.clone())]
        );
        assert_eq!(backend.branches.lock().clone(), vec![other.handle.branch_name.clone()]);
        assert_eq!(workspace_nonce(Path::new("/x/t-v-0a1b2c3d")), Some("0a1b2c3d"));
        assert_eq!(workspace_nonce(Path::new("/x/not-a-nonce")), None);
    }

    #[tokio::test]
    async fn dropping_a_run_stops_its_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = arena(dir.path());
        let ticks = Arc::new(AtomicUsize::new(0));
        let run = arena.run(
            ArenaRequest::new("t", "v", "p", "s"),
            Arc::new(Counts(ticks.clone())),
        );
        assert!(tokio::time::timeout(Duration::from_millis(60), run)
            .await
            .is_err());

        // Dropped mid-run: the handle is still tracked and the agent stops.
        assert_eq!(arena.active_handles().len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped_at = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), stopped_at);
        assert!(stopped_at < 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_get_distinct_workspaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = Arc::new(arena(dir.path()));
        let mut set = tokio::task::JoinSet::new();
        for i in 0..6 {
            let arena = arena.clone();
            set.spawn(async move {
                arena
                    .run(
                        ArenaRequest::new("shared", format!("v{i}"), "p", "s"),
                        Arc::new(WritesReport),
                    )
                    .await
            });
        }
        let mut paths = std::collections::HashSet::new();
        while let Some(joined) = set.join_next().await {
            let run = joined.expect("join").expect("run");
            assert_eq!(run.exit_code, 0);
            paths.insert(run.handle.path);
        }
        assert_eq!(paths.len(), 6);
        assert_eq!(arena.active_handles().len(), 6);
    }
}
