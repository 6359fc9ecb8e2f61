use serde::Serialize;
use std::path::PathBuf;

use crate::core::lock::LockOwner;
use crate::core::manifest::RunProgress;
use crate::core::tasks::{Group, TaskId};
use crate::core::workspace::Reclaim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    NoCommits,
    Error,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::NoCommits => "no_commits",
            JobOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationOutcome {
    Success,
    Conflict,
    Error,
}

impl IntegrationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationOutcome::Success => "success",
            IntegrationOutcome::Conflict => "conflict",
            IntegrationOutcome::Error => "error",
        }
    }
}

/// Terminal record of one job, produced by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub task_id: TaskId,
    pub description: String,
    pub group: Group,
    pub branch: String,
    pub workspace: PathBuf,
    pub status: JobStatus,
    pub outcome: JobOutcome,
    pub exit_code: Option<i32>,
    pub commits: u32,
    /// `None` when no workspace was provisioned.
    pub reclaim: Option<Reclaim>,
    pub branch_deleted: bool,
    pub log_ref: Option<PathBuf>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn left_in_place(&self) -> bool {
        self.reclaim == Some(Reclaim::LeftInPlace)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRecord {
    pub job_id: String,
    pub task_id: TaskId,
    pub branch: String,
    pub outcome: IntegrationOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrationReport {
    pub merged: Vec<TaskId>,
    pub preserved: Vec<String>,
    pub outcomes: Vec<MergeRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group: Group,
    pub jobs: Vec<JobResult>,
    pub integration: IntegrationReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub base_revision: String,
    pub target_line: String,
    pub groups: Vec<GroupSummary>,
    /// Tasks marked complete by this run.
    pub integrated: Vec<TaskId>,
    pub succeeded: usize,
    pub no_commits: usize,
    pub failed: usize,
    /// Branches kept for manual follow-up: failed merges and any job whose
    /// workspace holds residue.
    pub preserved_branches: Vec<String>,
    pub left_in_place: Vec<PathBuf>,
    pub reclaimed_lock: Option<LockOwner>,
    pub advisory: Option<String>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn new(run_id: &str, base_revision: &str, target_line: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            base_revision: base_revision.to_string(),
            target_line: target_line.to_string(),
            groups: Vec::new(),
            integrated: Vec::new(),
            succeeded: 0,
            no_commits: 0,
            failed: 0,
            preserved_branches: Vec::new(),
            left_in_place: Vec::new(),
            reclaimed_lock: None,
            advisory: None,
            interrupted: false,
        }
    }

    pub fn absorb(&mut self, group: GroupSummary) {
        for job in &group.jobs {
            match job.outcome {
                JobOutcome::Success => self.succeeded += 1,
                JobOutcome::NoCommits => self.no_commits += 1,
                JobOutcome::Error => self.failed += 1,
            }
            if job.left_in_place() {
                self.left_in_place.push(job.workspace.clone());
                // A workspace that is still around keeps its branch.
                if !group.integration.preserved.contains(&job.branch) {
                    self.preserved_branches.push(job.branch.clone());
                }
            }
        }
        self.integrated.extend(group.integration.merged.iter().copied());
        self.preserved_branches
            .extend(group.integration.preserved.iter().cloned());
        self.groups.push(group);
    }
}

/// What the dry run would do.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedGroup {
    pub group: Group,
    pub batches: Vec<Vec<TaskId>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub owner: LockOwner,
    pub alive: bool,
    pub age_secs: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupPending {
    pub group: Group,
    pub pending: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub lock: Option<LockStatus>,
    pub pending: Vec<GroupPending>,
    pub recent_runs: Vec<RunProgress>,
    pub workspaces: Vec<PathBuf>,
    pub task_source_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub kept_with_residue: Vec<PathBuf>,
    pub skipped_active: Vec<PathBuf>,
}
