//! Serial merge of successful job branches into the target line.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::git::{GitRepo, MergeAttempt};
use crate::core::manifest::{Manifest, NewEntry, Phase};
use crate::core::orchestrator::{
    IntegrationOutcome, IntegrationReport, JobOutcome, JobResult, MergeRecord,
};
use crate::core::tasks::{Group, TaskId, TaskStore};
use crate::core::workspace::Reclaim;

pub struct Integrator<'a> {
    pub git: &'a GitRepo,
    pub manifest: &'a Manifest,
    pub tasks: &'a TaskStore,
    pub run_id: &'a str,
    pub base_revision: &'a str,
    pub target_line: &'a str,
}

impl Integrator<'_> {
    /// Merge each successful job in order, then mark the merged tasks
    /// complete with one write and commit the task document.
    pub async fn integrate(&self, group: Group, jobs: &[JobResult]) -> Result<IntegrationReport> {
        let mut report = IntegrationReport::default();

        for job in jobs.iter().filter(|j| j.outcome == JobOutcome::Success) {
            let (outcome, detail) = self.merge_one(job).await;
            match outcome {
                IntegrationOutcome::Success => {
                    info!(job_id = %job.job_id, branch = %job.branch, "Merged");
                    report.merged.push(job.task_id);
                    if job.reclaim == Some(Reclaim::Cleaned) {
                        match self.git.delete_branch(&job.branch).await {
                            Ok(()) => {
                                self.record(Phase::BranchDeleted, group, job, "merged").await
                            }
                            Err(e) => {
                                warn!(branch = %job.branch, "Could not delete merged branch: {:#}", e)
                            }
                        }
                    }
                }
                IntegrationOutcome::Conflict | IntegrationOutcome::Error => {
                    warn!(
                        job_id = %job.job_id,
                        branch = %job.branch,
                        "Merge {}: {}; branch preserved",
                        outcome.as_str(),
                        detail.as_deref().unwrap_or("")
                    );
                    report.preserved.push(job.branch.clone());
                }
            }
            self.record(Phase::Merge, group, job, outcome.as_str()).await;
            report.outcomes.push(MergeRecord {
                job_id: job.job_id.clone(),
                task_id: job.task_id,
                branch: job.branch.clone(),
                outcome,
                detail,
            });
        }

        if !report.merged.is_empty() {
            self.complete_tasks(group, jobs, &report.merged).await?;
        }
        Ok(report)
    }

    async fn merge_one(&self, job: &JobResult) -> (IntegrationOutcome, Option<String>) {
        if let Err(e) = self.git.checkout(self.target_line).await {
            return (IntegrationOutcome::Error, Some(format!("{:#}", e)));
        }
        let message = format!("convoy: integrate {} ({})", job.task_id, job.branch);
        match self.git.merge(&job.branch, &message).await {
            Ok(MergeAttempt::Merged) => (IntegrationOutcome::Success, None),
            Ok(MergeAttempt::Conflict { files }) => {
                if let Err(e) = self.git.abort_merge().await {
                    warn!("merge --abort failed: {:#}", e);
                }
                (
                    IntegrationOutcome::Conflict,
                    Some(format!("conflicting paths: {}", files.join(", "))),
                )
            }
            Ok(MergeAttempt::Failed { message }) => {
                self.abort_if_started().await;
                (IntegrationOutcome::Error, Some(message))
            }
            Err(e) => {
                self.abort_if_started().await;
                (IntegrationOutcome::Error, Some(format!("{:#}", e)))
            }
        }
    }

    async fn abort_if_started(&self) {
        if self.git.merge_in_progress().await.unwrap_or(false)
            && let Err(e) = self.git.abort_merge().await
        {
            warn!("merge --abort failed: {:#}", e);
        }
    }

    async fn complete_tasks(&self, group: Group, jobs: &[JobResult], merged: &[TaskId]) -> Result<()> {
        let changed = self.tasks.mark_complete_many(merged)?;
        let ids = merged
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if changed > 0 {
            let branches = jobs
                .iter()
                .filter(|j| merged.contains(&j.task_id))
                .map(|j| format!("- {} {}", j.task_id, j.branch))
                .collect::<Vec<_>>()
                .join("\n");
            let message = format!("convoy: complete {}\n\n{}\n", ids, branches);
            self.git
                .commit_paths(&[self.tasks.path()], &message)
                .await
                .context("cannot commit task document")?;
        }
        info!(group = %group, tasks = %ids, "Tasks marked complete");

        for id in merged {
            let job = jobs.iter().find(|j| j.task_id == *id);
            let entry = NewEntry {
                run_id: self.run_id.to_string(),
                group: Some(group.to_string()),
                job_id: job.map(|j| j.job_id.clone()),
                task_id: Some(id.to_string()),
                branch_name: job.map(|j| j.branch.clone()),
                status: "completed".to_string(),
                base_revision: Some(self.base_revision.to_string()),
                ..Default::default()
            };
            if let Err(e) = self.manifest.append(Phase::TasksCompleted, entry).await {
                warn!(task_id = %id, "Failed to append tasks_completed to manifest: {}", e);
            }
        }
        Ok(())
    }

    async fn record(&self, phase: Phase, group: Group, job: &JobResult, status: &str) {
        let entry = NewEntry {
            run_id: self.run_id.to_string(),
            group: Some(group.to_string()),
            job_id: Some(job.job_id.clone()),
            task_id: Some(job.task_id.to_string()),
            branch_name: Some(job.branch.clone()),
            status: status.to_string(),
            base_revision: Some(self.base_revision.to_string()),
            log_ref: job.log_ref.as_ref().map(|p| p.display().to_string()),
        };
        if let Err(e) = self.manifest.append(phase, entry).await {
            warn!("Failed to append {} to manifest: {}", phase.as_str(), e);
        }
    }
}
