use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

use crucible_tools::list_workspace_files;

/// Versioned-workspace primitive the arena is built on: create a working
/// directory bound to a new branch off a base ref, remove it, commit in it.
#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, path: &Path, branch: &str, base_ref: &str) -> anyhow::Result<()>;

    async fn remove(&self, path: &Path, branch: Option<&str>) -> anyhow::Result<()>;

    /// Returns the new revision id, or `None` when there was nothing to commit.
    async fn commit(&self, path: &Path, message: &str) -> anyhow::Result<Option<String>>;

    /// Branch names matching a glob. Backends without branches have none.
    async fn branches_matching(&self, _pattern: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub struct GitWorktreeBackend {
    repo: PathBuf,
}

impl GitWorktreeBackend {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> anyhow::Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(cwd)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WorkspaceBackend for GitWorktreeBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn create(&self, path: &Path, branch: &str, base_ref: &str) -> anyhow::Result<()> {
        let target = path.to_string_lossy();
        self.git(&self.repo, &["worktree", "add", "-b", branch, &target, base_ref])
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &Path, branch: Option<&str>) -> anyhow::Result<()> {
        let target = path.to_string_lossy();
        if let Err(err) = self
            .git(&self.repo, &["worktree", "remove", "--force", &target])
            .await
        {
            tracing::warn!(worktree = %target, error = %err, "git worktree remove failed");
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("failed to remove {target}"))?;
        }
        self.git(&self.repo, &["worktree", "prune"]).await?;
        if let Some(branch) = branch {
            self.git(&self.repo, &["branch", "-D", branch]).await?;
        }
        Ok(())
    }

    async fn branches_matching(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let listed = self
            .git(
                &self.repo,
                &["branch", "--list", "--format=%(refname:short)", pattern],
            )
            .await?;
        Ok(listed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn commit(&self, path: &Path, message: &str) -> anyhow::Result<Option<String>> {
        self.git(path, &["add", "-A"]).await?;
        let status = self.git(path, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(None);
        }
        self.git(
            path,
            &[
                "-c",
                "user.name=crucible",
                "-c",
                "user.email=crucible@localhost",
                "commit",
                "-q",
                "-m",
                message,
            ],
        )
        .await?;
        Ok(Some(self.git(path, &["rev-parse", "HEAD"]).await?))
    }
}

/// Plain directories, optionally seeded with a copy of another tree. Used
/// where no repository is available; branches are nominal.
#[derive(Default)]
pub struct ScratchBackend {
    seed: Option<PathBuf>,
}

impl ScratchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded_from(seed: impl Into<PathBuf>) -> Self {
        Self {
            seed: Some(seed.into()),
        }
    }
}

#[async_trait]
impl WorkspaceBackend for ScratchBackend {
    fn name(&self) -> &'static str {
        "scratch"
    }

    async fn create(&self, path: &Path, _branch: &str, _base_ref: &str) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!("workspace already exists: {}", path.display());
        }
        tokio::fs::create_dir_all(path).await?;
        let Some(seed) = self.seed.clone() else {
            return Ok(());
        };
        let files = tokio::task::spawn_blocking({
            let seed = seed.clone();
            move || list_workspace_files(&seed)
        })
        .await?;
        for rel in files {
            let dest = path.join(&rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(seed.join(&rel), &dest)
                .await
                .with_context(|| format!("failed to seed {rel}"))?;
        }
        Ok(())
    }

    async fn remove(&self, path: &Path, _branch: Option<&str>) -> anyhow::Result<()> {
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }

    async fn commit(&self, _path: &Path, _message: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
