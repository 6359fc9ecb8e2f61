//! Bounded-concurrency batch execution of one group's tasks.
//!
//! Each batch provisions its workspaces serially, runs every agent as its own
//! task on a `JoinSet` and waits for all of them. Classification, reclaim and
//! branch cleanup then happen serially against the main checkout.

use anyhow::{Result, bail};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::core::agent::{AgentExit, JobSpec, WorkAgent};
use crate::core::git::GitRepo;
use crate::core::manifest::{Manifest, NewEntry, Phase};
use crate::core::orchestrator::{JobOutcome, JobResult, JobStatus, can_transition};
use crate::core::tasks::{Group, Task};
use crate::core::workspace::{self, Reclaim, Workspace, WorkspaceManager};

/// Split `tasks` into consecutive batches of at most `max_parallel` entries.
pub fn plan_batches(tasks: &[Task], max_parallel: usize) -> Vec<Vec<Task>> {
    tasks
        .chunks(max_parallel.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Workspaces provisioned and not yet removed, for interrupt reporting.
#[derive(Debug, Clone, Default)]
pub struct ActiveWorkspaces(Arc<Mutex<Vec<PathBuf>>>);

impl ActiveWorkspaces {
    fn insert(&self, path: &Path) {
        if let Ok(mut paths) = self.0.lock() {
            paths.push(path.to_path_buf());
        }
    }

    fn remove(&self, path: &Path) {
        if let Ok(mut paths) = self.0.lock() {
            paths.retain(|p| p != path);
        }
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.0.lock().map(|paths| paths.clone()).unwrap_or_default()
    }
}

/// Jobs of one group that reached a result. `interrupted` is set when a stop
/// request cut the group short; jobs still running then have no result.
#[derive(Debug, Default)]
pub struct GroupRun {
    pub jobs: Vec<JobResult>,
    pub interrupted: bool,
}

enum Execution {
    Exited(AgentExit),
    Crashed(String),
    TimedOut(Duration),
}

struct Job {
    id: String,
    task: Task,
    status: JobStatus,
    workspace: Workspace,
    log_path: PathBuf,
}

impl Job {
    fn advance(&mut self, to: JobStatus) -> Result<()> {
        if !can_transition(self.status, to) {
            bail!(
                "{}: illegal transition {} -> {}",
                self.id,
                self.status.as_str(),
                to.as_str()
            );
        }
        self.status = to;
        Ok(())
    }
}

pub struct Scheduler {
    git: GitRepo,
    workspaces: WorkspaceManager,
    agent: Arc<dyn WorkAgent>,
    manifest: Manifest,
    run_id: String,
    logs_dir: PathBuf,
    timeout: Option<Duration>,
    next_job: usize,
    active: ActiveWorkspaces,
    stop: watch::Receiver<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        git: GitRepo,
        workspaces: WorkspaceManager,
        agent: Arc<dyn WorkAgent>,
        manifest: Manifest,
        run_id: &str,
        logs_dir: PathBuf,
        timeout: Option<Duration>,
        active: ActiveWorkspaces,
    ) -> Self {
        Self {
            git,
            workspaces,
            agent,
            manifest,
            run_id: run_id.to_string(),
            logs_dir,
            timeout,
            next_job: 0,
            active,
            stop: watch::channel(false).1,
        }
    }

    /// Abandon running agents once `stop` turns true. Provisioning and
    /// post-run bookkeeping are never cut short.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = stop;
        self
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn entry(&self, group: Group, job_id: &str, task: &Task, branch: &str, status: &str) -> NewEntry {
        NewEntry {
            run_id: self.run_id.clone(),
            group: Some(group.to_string()),
            job_id: Some(job_id.to_string()),
            task_id: Some(task.id.to_string()),
            branch_name: Some(branch.to_string()),
            status: status.to_string(),
            base_revision: Some(self.workspaces.base_revision().to_string()),
            log_ref: None,
        }
    }

    async fn record(&self, phase: Phase, entry: NewEntry) {
        if let Err(e) = self.manifest.append(phase, entry).await {
            warn!("Failed to append {} to manifest: {}", phase.as_str(), e);
        }
    }

    /// Run every task of one group in batches of at most `max_parallel`.
    /// A failing job never stops the rest of its batch.
    pub async fn run_group(
        &mut self,
        group: Group,
        tasks: &[Task],
        max_parallel: usize,
    ) -> Result<GroupRun> {
        let batches = plan_batches(tasks, max_parallel);
        info!(group = %group, tasks = tasks.len(), batches = batches.len(), "Running group");

        let mut run = GroupRun::default();
        for (index, batch) in batches.into_iter().enumerate() {
            if self.stop_requested() {
                run.interrupted = true;
                break;
            }
            info!(group = %group, batch = index + 1, size = batch.len(), "Starting batch");
            let (results, interrupted) = self.run_batch(group, batch).await?;
            run.jobs.extend(results);
            if interrupted {
                run.interrupted = true;
                break;
            }
        }
        Ok(run)
    }

    async fn run_batch(&mut self, group: Group, batch: Vec<Task>) -> Result<(Vec<JobResult>, bool)> {
        let mut results = Vec::new();
        let mut jobs = Vec::new();

        for task in batch {
            self.next_job += 1;
            let job_id = workspace::job_id(self.next_job);
            let branch = workspace::branch_name(&self.run_id, &job_id, task.id);
            match self.workspaces.provision(&job_id, task.id).await {
                Ok(ws) => {
                    self.active.insert(&ws.path);
                    self.record(
                        Phase::JobProvisioned,
                        self.entry(group, &job_id, &task, &ws.branch, "provisioned"),
                    )
                    .await;
                    jobs.push(Job {
                        log_path: self.logs_dir.join(format!("{}.log", job_id)),
                        id: job_id,
                        task,
                        status: JobStatus::Pending,
                        workspace: ws,
                    });
                }
                Err(e) => {
                    error!(job_id = %job_id, task_id = %task.id, "Provisioning failed: {:#}", e);
                    if !can_transition(JobStatus::Pending, JobStatus::Failed) {
                        bail!("{}: cannot fail a pending job", job_id);
                    }
                    self.record(
                        Phase::JobProvisioned,
                        self.entry(group, &job_id, &task, &branch, JobStatus::Failed.as_str()),
                    )
                    .await;
                    results.push(JobResult {
                        workspace: self.workspaces.slot(&job_id),
                        job_id,
                        task_id: task.id,
                        description: task.description,
                        group,
                        branch,
                        status: JobStatus::Failed,
                        outcome: JobOutcome::Error,
                        exit_code: None,
                        commits: 0,
                        reclaim: None,
                        branch_deleted: false,
                        log_ref: None,
                        error: Some(format!("{:#}", e)),
                    });
                }
            }
        }

        let mut set = JoinSet::new();
        let mut slots = HashMap::new();
        for (index, job) in jobs.iter_mut().enumerate() {
            job.advance(JobStatus::Running)?;
            let mut entry = self.entry(group, &job.id, &job.task, &job.workspace.branch, "running");
            entry.log_ref = Some(job.log_path.display().to_string());
            self.record(Phase::JobStarted, entry).await;

            let spec = JobSpec {
                run_id: self.run_id.clone(),
                job_id: job.id.clone(),
                task_id: job.task.id,
                description: job.task.description.clone(),
                branch: job.workspace.branch.clone(),
                base_revision: job.workspace.base_revision.clone(),
                workspace: job.workspace.path.clone(),
                log_path: job.log_path.clone(),
            };
            let agent = Arc::clone(&self.agent);
            let timeout = self.timeout;
            let handle = set.spawn(async move { execute(agent, spec, timeout).await });
            slots.insert(handle.id(), index);
        }

        let mut executions: HashMap<usize, Execution> = HashMap::new();
        let mut stop = self.stop.clone();
        loop {
            let next = tokio::select! {
                joined = set.join_next_with_id() => Some(joined),
                _ = stopped(&mut stop) => None,
            };
            let Some(next) = next else {
                warn!(running = set.len(), "Stop requested; abandoning running agents");
                // Dropping the set kills the agents; their workspaces stay as they are.
                return Ok((results, true));
            };
            let Some(joined) = next else {
                break;
            };
            match joined {
                Ok((id, execution)) => {
                    if let Some(&index) = slots.get(&id) {
                        executions.insert(index, execution);
                    }
                }
                Err(e) => {
                    if let Some(&index) = slots.get(&e.id()) {
                        executions.insert(index, Execution::Crashed(format!("agent task failed: {}", e)));
                    }
                }
            }
        }

        for (index, job) in jobs.into_iter().enumerate() {
            let execution = executions
                .remove(&index)
                .unwrap_or_else(|| Execution::Crashed("agent task vanished".to_string()));
            results.push(self.finish(group, job, execution).await?);
        }
        Ok((results, false))
    }

    async fn finish(&self, group: Group, mut job: Job, execution: Execution) -> Result<JobResult> {
        let (exit_code, failure) = match execution {
            Execution::Exited(exit) => (exit.code, None),
            Execution::Crashed(message) => (None, Some(message)),
            Execution::TimedOut(limit) => (
                None,
                Some(format!("agent timed out after {}s", limit.as_secs())),
            ),
        };
        job.advance(if failure.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Done
        })?;
        let mut finished = self.entry(group, &job.id, &job.task, &job.workspace.branch, job.status.as_str());
        finished.log_ref = Some(job.log_path.display().to_string());
        self.record(Phase::JobFinished, finished).await;

        let mut error = failure;
        let mut commits = 0;
        let outcome = if job.status == JobStatus::Failed {
            JobOutcome::Error
        } else {
            match self
                .git
                .commit_count(&job.workspace.base_revision, &job.workspace.branch)
                .await
            {
                Ok(0) => JobOutcome::NoCommits,
                Ok(n) => {
                    commits = n;
                    if exit_code == Some(0) {
                        JobOutcome::Success
                    } else {
                        error = Some(format!("agent exited with status {:?}", exit_code));
                        JobOutcome::Error
                    }
                }
                Err(e) => {
                    error = Some(format!("{:#}", e));
                    JobOutcome::Error
                }
            }
        };
        match outcome {
            JobOutcome::Success => info!(job_id = %job.id, task_id = %job.task.id, commits, "Job succeeded"),
            JobOutcome::NoCommits => info!(job_id = %job.id, task_id = %job.task.id, "Job produced no commits"),
            JobOutcome::Error => warn!(
                job_id = %job.id,
                task_id = %job.task.id,
                "Job failed: {}",
                error.as_deref().unwrap_or("unknown error")
            ),
        }

        let reclaim = match self.workspaces.reclaim(&job.workspace).await {
            Ok(reclaim) => reclaim,
            Err(e) => {
                warn!(job_id = %job.id, "Could not reclaim workspace: {:#}", e);
                Reclaim::LeftInPlace
            }
        };
        if reclaim == Reclaim::Cleaned {
            self.active.remove(&job.workspace.path);
        } else {
            warn!(
                job_id = %job.id,
                path = %job.workspace.path.display(),
                "Workspace left in place"
            );
        }
        let cleanup_status = match reclaim {
            Reclaim::Cleaned => "cleaned",
            Reclaim::LeftInPlace => "left_in_place",
        };
        self.record(
            Phase::JobCleanup,
            self.entry(group, &job.id, &job.task, &job.workspace.branch, cleanup_status),
        )
        .await;

        let mut branch_deleted = false;
        if outcome != JobOutcome::Success && reclaim == Reclaim::Cleaned {
            match self.workspaces.delete_branch(&job.workspace.branch).await {
                Ok(()) => {
                    branch_deleted = true;
                    self.record(
                        Phase::BranchDeleted,
                        self.entry(group, &job.id, &job.task, &job.workspace.branch, outcome.as_str()),
                    )
                    .await;
                }
                Err(e) => warn!(branch = %job.workspace.branch, "Could not delete branch: {:#}", e),
            }
        }

        Ok(JobResult {
            job_id: job.id,
            task_id: job.task.id,
            description: job.task.description,
            group,
            branch: job.workspace.branch,
            workspace: job.workspace.path,
            status: job.status,
            outcome,
            exit_code,
            commits,
            reclaim: Some(reclaim),
            branch_deleted,
            log_ref: Some(job.log_path),
            error,
        })
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let requested = stop.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        // Sender gone: nobody can ask us to stop any more.
        std::future::pending::<()>().await;
    }
}

async fn execute(agent: Arc<dyn WorkAgent>, spec: JobSpec, timeout: Option<Duration>) -> Execution {
    let run = agent.execute(&spec);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => return Execution::TimedOut(limit),
        },
        None => run.await,
    };
    match result {
        Ok(exit) => Execution::Exited(exit),
        Err(e) => Execution::Crashed(format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tasks::{TaskId, TaskStatus};
    use crate::core::test_support::{ScriptedAgent, branches, head, init_repo, repo};

    fn task(n: usize, description: &str) -> Task {
        Task {
            id: TaskId(n),
            description: description.to_string(),
            group: Group::Explicit(1),
            status: TaskStatus::Pending,
            line: n,
        }
    }

    fn scheduler(
        root: &Path,
        agent: Arc<dyn WorkAgent>,
        timeout: Option<Duration>,
    ) -> (Scheduler, Manifest) {
        let base = head(root);
        let manifest = Manifest::in_memory().unwrap();
        let workspaces = WorkspaceManager::new(repo(root), root.join(".convoy/worktrees"), "r1", &base);
        let scheduler = Scheduler::new(
            repo(root),
            workspaces,
            agent,
            manifest.clone(),
            "r1",
            root.join(".convoy/logs/r1"),
            timeout,
            ActiveWorkspaces::default(),
        );
        (scheduler, manifest)
    }

    #[test]
    fn batches_respect_the_limit_and_document_order() {
        let tasks: Vec<Task> = (1..=5).map(|n| task(n, "x")).collect();
        let ids = |batches: Vec<Vec<Task>>| -> Vec<Vec<usize>> {
            batches
                .into_iter()
                .map(|b| b.into_iter().map(|t| t.id.0).collect())
                .collect()
        };
        assert_eq!(ids(plan_batches(&tasks, 2)), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(ids(plan_batches(&tasks, 0)).len(), 5);
        assert_eq!(ids(plan_batches(&tasks, 10)), vec![vec![1, 2, 3, 4, 5]]);
        assert!(plan_batches(&[], 3).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn outcomes_are_classified_and_failures_do_not_stop_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path(), &[]);
        let agent = ScriptedAgent::new();
        let (mut scheduler, manifest) = scheduler(tmp.path(), agent.clone(), None);

        let tasks = vec![
            task(1, "add feature one"),
            task(2, "nothing to do"),
            task(3, "commit then fail"),
            task(4, "crash loudly"),
        ];
        let results = scheduler.run_group(Group::Explicit(1), &tasks, 4).await.unwrap().jobs;
        assert_eq!(results.len(), 4);
        assert_eq!(agent.peak(), 4);

        let by_task = |n: usize| results.iter().find(|r| r.task_id == TaskId(n)).unwrap();
        assert_eq!(by_task(1).outcome, JobOutcome::Success);
        assert_eq!(by_task(1).commits, 1);
        assert!(!by_task(1).branch_deleted);

        assert_eq!(by_task(2).outcome, JobOutcome::NoCommits);
        assert_eq!(by_task(2).status, JobStatus::Done);
        assert!(by_task(2).branch_deleted);

        assert_eq!(by_task(3).outcome, JobOutcome::Error);
        assert_eq!(by_task(3).exit_code, Some(1));

        assert_eq!(by_task(4).outcome, JobOutcome::Error);
        assert_eq!(by_task(4).status, JobStatus::Failed);
        assert!(by_task(4).error.as_deref().unwrap().contains("blew up"));

        let remaining = branches(tmp.path());
        assert!(remaining.contains(&by_task(1).branch));
        for n in [2, 3, 4] {
            assert!(!remaining.contains(&by_task(n).branch));
            assert_eq!(by_task(n).reclaim, Some(Reclaim::Cleaned));
        }
        assert!(results.iter().all(|r| !r.workspace.exists()));

        let entries = manifest.entries(&Default::default()).await.unwrap();
        let count = |phase: &str| entries.iter().filter(|e| e.phase == phase).count();
        assert_eq!(count("job_provisioned"), 4);
        assert_eq!(count("job_started"), 4);
        assert_eq!(count("job_finished"), 4);
        assert_eq!(count("branch_deleted"), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_per_batch_and_jobs_share_the_base() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path(), &[]);
        let base = head(tmp.path());
        let agent = ScriptedAgent::new();
        let (mut scheduler, _) = scheduler(tmp.path(), agent.clone(), None);

        let tasks: Vec<Task> = (1..=5).map(|n| task(n, "work")).collect();
        let results = scheduler.run_group(Group::Explicit(1), &tasks, 2).await.unwrap().jobs;
        assert_eq!(agent.peak(), 2);
        let job_ids: Vec<&str> = results.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(job_ids, vec!["job-1", "job-2", "job-3", "job-4", "job-5"]);
        assert!(agent.started().iter().all(|(_, rev)| *rev == base));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_agent_fails_its_job() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path(), &[]);
        let agent = ScriptedAgent::new();
        let (mut scheduler, _) =
            scheduler(tmp.path(), agent, Some(Duration::from_millis(500)));

        let results = scheduler
            .run_group(Group::Default, &[task(1, "hang forever")], 1)
            .await
            .unwrap()
            .jobs;
        assert_eq!(results[0].status, JobStatus::Failed);
        assert_eq!(results[0].outcome, JobOutcome::Error);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn residue_keeps_workspace_and_branch() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path(), &[]);
        let agent = ScriptedAgent::new();
        let (mut scheduler, _) = scheduler(tmp.path(), agent, None);

        let results = scheduler
            .run_group(Group::Default, &[task(1, "fail with residue")], 1)
            .await
            .unwrap()
            .jobs;
        assert_eq!(results[0].outcome, JobOutcome::Error);
        assert_eq!(results[0].reclaim, Some(Reclaim::LeftInPlace));
        assert!(!results[0].branch_deleted);
        assert!(results[0].workspace.join("scratch.tmp").exists());
        assert!(branches(tmp.path()).contains(&results[0].branch));
        assert_eq!(scheduler.active.snapshot(), vec![results[0].workspace.clone()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_abandons_running_agents_and_skips_later_batches() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path(), &[]);
        let agent = ScriptedAgent::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (scheduler, _) = scheduler(tmp.path(), agent.clone(), None);
        let mut scheduler = scheduler.with_stop(stop_rx);

        let tasks = vec![task(1, "hang forever"), task(2, "add feature two")];
        let watcher = agent.clone();
        let stopper = tokio::spawn(async move {
            while watcher.started().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            stop_tx.send(true).unwrap();
            stop_tx
        });
        let run = tokio::time::timeout(
            Duration::from_secs(20),
            scheduler.run_group(Group::Default, &tasks, 1),
        )
        .await
        .expect("stop should end the group")
        .unwrap();
        let _stop_tx = stopper.await.unwrap();

        assert!(run.interrupted);
        assert!(run.jobs.is_empty());
        assert_eq!(agent.started().len(), 1);
        let slot = scheduler.workspaces.slot("job-1");
        assert_eq!(scheduler.active.snapshot(), vec![slot.clone()]);
        assert!(slot.exists());
    }
}
