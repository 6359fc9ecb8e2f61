//! Isolated per-job worktrees anchored to the run's baseline revision.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::git::GitRepo;
use crate::core::tasks::TaskId;
use crate::platform::{NativePlatform, Platform};

/// `YYYYMMDD-HHMMSS-xxxxxx`, UTC.
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S"),
        &suffix[..6]
    )
}

pub fn job_id(ordinal: usize) -> String {
    format!("job-{}", ordinal)
}

pub fn branch_name(run_id: &str, job_id: &str, task_id: TaskId) -> String {
    format!("convoy/{}/{}-{}", run_id, job_id, task_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub job_id: String,
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
    pub base_revision: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reclaim {
    Cleaned,
    LeftInPlace,
}

/// Provisions slots under `<worktrees_dir>/<run_id>/<job_id>`, so one run
/// never reuses a slot another run left behind.
pub struct WorkspaceManager {
    git: GitRepo,
    worktrees_dir: PathBuf,
    run_dir: PathBuf,
    run_id: String,
    base_revision: String,
}

impl WorkspaceManager {
    pub fn new(
        git: GitRepo,
        worktrees_dir: impl Into<PathBuf>,
        run_id: &str,
        base_revision: &str,
    ) -> Self {
        let worktrees_dir = worktrees_dir.into();
        Self {
            git,
            run_dir: worktrees_dir.join(run_id),
            worktrees_dir,
            run_id: run_id.to_string(),
            base_revision: base_revision.to_string(),
        }
    }

    pub fn base_revision(&self) -> &str {
        &self.base_revision
    }

    pub fn slot(&self, job_id: &str) -> PathBuf {
        self.run_dir.join(job_id)
    }

    pub async fn provision(&self, job_id: &str, task_id: TaskId) -> Result<Workspace> {
        tokio::fs::create_dir_all(&self.run_dir)
            .await
            .with_context(|| format!("cannot create {}", self.run_dir.display()))?;
        NativePlatform::restrict_dir_permissions(&self.worktrees_dir);
        NativePlatform::restrict_dir_permissions(&self.run_dir);

        let path = self.slot(job_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(job_id, path = %path.display(), "Slot already occupied in this run; replacing it");
            self.clear_slot(&path).await?;
        }

        let branch = branch_name(&self.run_id, job_id, task_id);
        if self.git.branch_exists(&branch).await? {
            bail!("branch {} already exists", branch);
        }

        self.git
            .add_worktree(&path, &branch, &self.base_revision)
            .await
            .with_context(|| format!("cannot provision workspace for {}", job_id))?;
        info!(job_id, task_id = %task_id, branch = %branch, "Workspace provisioned");

        Ok(Workspace {
            job_id: job_id.to_string(),
            task_id,
            path,
            branch,
            base_revision: self.base_revision.clone(),
        })
    }

    async fn clear_slot(&self, path: &Path) -> Result<()> {
        if let Err(e) = self.git.remove_worktree(path, true).await {
            debug!("worktree remove failed ({}); deleting directory", e);
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(path)
                    .await
                    .with_context(|| format!("cannot clear {}", path.display()))?;
            }
        }
        self.git.prune_worktrees().await
    }

    /// Remove the worktree when it has no uncommitted changes.
    pub async fn reclaim(&self, workspace: &Workspace) -> Result<Reclaim> {
        reclaim_worktree(&self.git, &workspace.path).await
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git.delete_branch(branch).await?;
        debug!(branch, "Branch deleted");
        Ok(())
    }
}

pub async fn reclaim_worktree(git: &GitRepo, path: &Path) -> Result<Reclaim> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        git.prune_worktrees().await?;
        return Ok(Reclaim::Cleaned);
    }
    if git.has_uncommitted_changes(path).await? {
        info!(path = %path.display(), "Workspace has residue; leaving it in place");
        return Ok(Reclaim::LeftInPlace);
    }
    git.remove_worktree(path, false).await?;
    git.prune_worktrees().await?;
    debug!(path = %path.display(), "Workspace removed");
    Ok(Reclaim::Cleaned)
}
