//! Per-agent git worktrees.
//!
//! Each agent owns `{data_dir}/worktrees/{agent_id}` checked out at its
//! branch. Operations shell out to `git worktree`; libgit2 has no complete
//! equivalent. A trait seam lets tests run without a real repository.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git invocation failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },
}

#[async_trait]
pub trait WorktreeOps: Send + Sync {
    /// Create (or reuse) the worktree for an agent at `branch`.
    async fn create(&self, agent_id: &str, branch: &str) -> Result<PathBuf, WorktreeError>;

    /// Make sure the worktree exists, recreating it if the directory went
    /// missing. Wake must never fail on a reclaimable filesystem error.
    async fn ensure(&self, agent_id: &str, branch: &str) -> Result<PathBuf, WorktreeError>;

    /// Remove an agent's worktree. Best-effort on a tree that is already gone.
    async fn remove(&self, agent_id: &str) -> Result<(), WorktreeError>;
}

pub struct GitWorktrees {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitWorktrees {
    pub fn new(repo_root: &Path, data_dir: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            worktrees_dir: data_dir.join("worktrees"),
        }
    }

    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        self.worktrees_dir.join(agent_id)
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await?;
        if !output.status.success() {
            return Err(WorktreeError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WorktreeOps for GitWorktrees {
    async fn create(&self, agent_id: &str, branch: &str) -> Result<PathBuf, WorktreeError> {
        let path = self.path_for(agent_id);
        if path.exists() {
            return Ok(path);
        }
        std::fs::create_dir_all(&self.worktrees_dir).map_err(WorktreeError::Io)?;

        let path_str = path.to_string_lossy().into_owned();
        // -B: create the branch if missing, reuse it if an earlier run left
        // it behind.
        self.run_git(&["worktree", "add", "-B", branch, &path_str])
            .await?;
        info!(agent_id = %agent_id, branch = %branch, path = %path.display(), "Created worktree");
        Ok(path)
    }

    async fn ensure(&self, agent_id: &str, branch: &str) -> Result<PathBuf, WorktreeError> {
        let path = self.path_for(agent_id);
        if path.exists() {
            return Ok(path);
        }
        warn!(agent_id = %agent_id, "Worktree missing on wake; recreating");
        // Stale bookkeeping from the vanished tree blocks re-adding.
        let _ = self.run_git(&["worktree", "prune"]).await;
        self.create(agent_id, branch).await
    }

    async fn remove(&self, agent_id: &str) -> Result<(), WorktreeError> {
        let path = self.path_for(agent_id);
        let path_str = path.to_string_lossy().into_owned();
        if path.exists() {
            if let Err(e) = self
                .run_git(&["worktree", "remove", "--force", &path_str])
                .await
            {
                warn!(agent_id = %agent_id, error = %e, "git worktree remove failed");
            }
        }
        let _ = self.run_git(&["worktree", "prune"]).await;
        Ok(())
    }
}
