use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::info;

use crate::core::tasks::TaskId;
use crate::platform::{NativePlatform, Platform};

/// Everything an agent needs to perform one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub run_id: String,
    pub job_id: String,
    pub task_id: TaskId,
    pub description: String,
    pub branch: String,
    pub base_revision: String,
    pub workspace: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// The unit of work performed inside a workspace. Results must be commits on
/// the job's branch; the exit status only signals success or failure.
#[async_trait]
pub trait WorkAgent: Send + Sync {
    async fn execute(&self, job: &JobSpec) -> Result<AgentExit>;
}

/// Runs a shell command in the workspace with the task description as `$1`.
pub struct CommandAgent {
    command: String,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl WorkAgent for CommandAgent {
    async fn execute(&self, job: &JobSpec) -> Result<AgentExit> {
        if let Some(parent) = job.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::File::create(&job.log_path)
            .with_context(|| format!("cannot create {}", job.log_path.display()))?;
        let log_err = log.try_clone()?;

        let mut cmd = NativePlatform::shell_inline(&self.command);
        cmd.arg(&job.description)
            .current_dir(&job.workspace)
            .env("CONVOY_RUN_ID", &job.run_id)
            .env("CONVOY_JOB_ID", &job.job_id)
            .env("CONVOY_TASK_ID", job.task_id.to_string())
            .env("CONVOY_TASK", &job.description)
            .env("CONVOY_BRANCH", &job.branch)
            .env("CONVOY_BASE_REVISION", &job.base_revision)
            .env("CONVOY_WORKSPACE", &job.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        info!(job_id = %job.job_id, task_id = %job.task_id, "Starting agent");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent for {}", job.job_id))?;
        let status = child.wait().await?;
        Ok(AgentExit {
            code: status.code(),
        })
    }
}
