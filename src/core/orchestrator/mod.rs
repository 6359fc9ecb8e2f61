//! Run driver: lock, preflight, group-by-group scheduling and integration,
//! plus `status` and `cleanup`.

mod types;

pub use types::*;

use anyhow::{Context, Result, bail};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::core::agent::WorkAgent;
use crate::core::config::RunSettings;
use crate::core::git::GitRepo;
use crate::core::integration::Integrator;
use crate::core::lock::{LockAcquisition, LockHandle, RunLock};
use crate::core::manifest::{MANIFEST_DB, Manifest, NewEntry, Phase};
use crate::core::scheduler::{ActiveWorkspaces, Scheduler, plan_batches};
use crate::core::tasks::TaskStore;
use crate::core::workspace::{self, Reclaim, WorkspaceManager};
use crate::platform::{NativePlatform, Platform};

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    match from {
        JobStatus::Pending => matches!(to, JobStatus::Running | JobStatus::Failed),
        _ => matches!(to, JobStatus::Done | JobStatus::Failed),
    }
}

/// Create the state directory and keep it out of the repository's status.
pub async fn ensure_state_dir(state_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(state_dir)
        .await
        .with_context(|| format!("cannot create {}", state_dir.display()))?;
    NativePlatform::restrict_dir_permissions(state_dir);
    let ignore = state_dir.join(".gitignore");
    if !tokio::fs::try_exists(&ignore).await.unwrap_or(false) {
        tokio::fs::write(&ignore, "*\n").await?;
    }
    Ok(())
}

struct RunContext<'a> {
    run_id: &'a str,
    base_revision: &'a str,
    target_line: &'a str,
    manifest: &'a Manifest,
    store: &'a TaskStore,
    agent: Arc<dyn WorkAgent>,
    active: ActiveWorkspaces,
}

pub struct Orchestrator {
    settings: RunSettings,
    git: GitRepo,
    tee_run_log: bool,
}

impl Orchestrator {
    pub fn new(settings: RunSettings) -> Self {
        let git = GitRepo::new(
            &settings.repo_root,
            &settings.author_name,
            &settings.author_email,
        );
        Self {
            settings,
            git,
            tee_run_log: false,
        }
    }

    /// Copy log output into `<state_dir>/logs/<run_id>/orchestrator.log`
    /// while a run is active.
    pub fn with_run_log(mut self) -> Self {
        self.tee_run_log = true;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Groups and batches a run would execute, without touching git or the lock.
    pub fn plan(&self) -> Result<Vec<PlannedGroup>> {
        let store = TaskStore::open(&self.settings.task_file);
        let mut planned = Vec::new();
        for group in store.pending_groups()? {
            let tasks = store.tasks_by_group(group)?;
            let batches = plan_batches(&tasks, self.settings.max_parallel)
                .into_iter()
                .map(|batch| batch.into_iter().map(|t| t.id).collect())
                .collect();
            planned.push(PlannedGroup { group, batches });
        }
        Ok(planned)
    }

    async fn preflight(&self, store: &TaskStore) -> Result<()> {
        let path = store.path();
        store.tasks()?;
        if !self.git.is_tracked(path).await? {
            bail!(
                "{} is not tracked by git; commit it before running",
                path.display()
            );
        }
        if !self.git.path_is_clean(path).await? {
            bail!(
                "{} has uncommitted changes; commit them before running",
                path.display()
            );
        }
        if self.git.merge_in_progress().await? {
            bail!("a merge is in progress in {}", self.settings.repo_root.display());
        }
        match &self.settings.integration_branch {
            Some(name) => {
                if self.git.branch_exists(name).await? {
                    bail!("integration branch {} already exists", name);
                }
            }
            None => {
                if self.git.current_branch().await?.is_none() {
                    bail!("HEAD is detached; check out a branch or pass --integration-branch");
                }
            }
        }
        Ok(())
    }

    pub async fn run(&self, agent: Arc<dyn WorkAgent>) -> Result<RunSummary> {
        self.run_until(agent, std::future::pending()).await
    }

    /// Run to completion, or stop early when `shutdown` resolves. Workspaces
    /// of interrupted jobs are left in place and reported.
    pub async fn run_until<F>(&self, agent: Arc<dyn WorkAgent>, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let settings = &self.settings;
        ensure_state_dir(&settings.state_dir).await?;

        let run_id = workspace::new_run_id();
        let mut lock = match RunLock::acquire(&settings.state_dir, &run_id, settings.stale_after)? {
            LockAcquisition::Acquired(handle) => handle,
            LockAcquisition::Busy(owner) => bail!(
                "another run holds the lock: run {} (pid {} on {}, started {}s ago)",
                owner.run_id,
                owner.owner_pid,
                owner.owner_host,
                owner.age().as_secs()
            ),
        };

        if self.tee_run_log {
            let path = settings.logs_dir(&run_id).join("orchestrator.log");
            if let Err(e) = crate::logging::attach_run_log(&path) {
                warn!("Cannot write {}: {}", path.display(), e);
            }
        }
        let result = self.run_locked(&run_id, &lock, agent, shutdown).await;
        if self.tee_run_log {
            crate::logging::detach_run_log();
        }
        lock.release();
        result
    }

    async fn run_locked<F>(
        &self,
        run_id: &str,
        lock: &LockHandle,
        agent: Arc<dyn WorkAgent>,
        shutdown: F,
    ) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let settings = &self.settings;
        let store = TaskStore::open(&settings.task_file);
        self.preflight(&store).await?;

        let manifest = Manifest::open(&settings.state_dir).await?;
        let base_revision = self.git.head_revision().await?;
        let target_line = match &settings.integration_branch {
            Some(name) => {
                self.git.create_branch(name, &base_revision).await?;
                info!(branch = %name, "Created integration branch");
                name.clone()
            }
            None => self
                .git
                .current_branch()
                .await?
                .context("HEAD is detached")?,
        };

        let mut summary = RunSummary::new(run_id, &base_revision, &target_line);
        if let Some(previous) = lock.reclaimed_from() {
            let status = format!(
                "reclaimed from run {} (pid {} on {})",
                previous.run_id, previous.owner_pid, previous.owner_host
            );
            self.append(&manifest, Phase::LockReclaimed, NewEntry::run(run_id, status))
                .await;
            summary.reclaimed_lock = Some(previous.clone());
        }
        let mut started = NewEntry::run(run_id, "started");
        started.base_revision = Some(base_revision.clone());
        started.branch_name = Some(target_line.clone());
        self.append(&manifest, Phase::RunStarted, started).await;
        info!(
            run_id = %run_id,
            base = %base_revision,
            target = %target_line,
            max_parallel = settings.max_parallel,
            "Run started"
        );

        let ctx = RunContext {
            run_id,
            base_revision: &base_revision,
            target_line: &target_line,
            manifest: &manifest,
            store: &store,
            agent,
            active: ActiveWorkspaces::default(),
        };
        let progress = Mutex::new(summary);

        // Shutdown only raises the stop flag. The scheduler abandons running
        // agents on it; an integration already underway runs to completion.
        let (stop_tx, stop_rx) = watch::channel(false);
        let outcome = {
            let drive = self.drive(&ctx, &progress, stop_rx);
            tokio::pin!(drive);
            tokio::select! {
                result = &mut drive => result,
                _ = shutdown => {
                    warn!(run_id = %run_id, "Interrupt received; stopping after the current step");
                    let _ = stop_tx.send(true);
                    drive.await
                }
            }
        };

        let mut summary = progress
            .into_inner()
            .map_err(|_| anyhow::anyhow!("run summary poisoned"))?;
        let status = match outcome {
            Ok(false) => "completed",
            Ok(true) => {
                summary.interrupted = true;
                for path in ctx.active.snapshot() {
                    if !summary.left_in_place.contains(&path) {
                        summary.left_in_place.push(path);
                    }
                }
                if self.git.merge_in_progress().await.unwrap_or(false) {
                    warn!("Aborting merge left by the interrupted run");
                    if let Err(e) = self.git.abort_merge().await {
                        error!("merge --abort failed: {:#}", e);
                    }
                }
                "interrupted"
            }
            Err(ref e) => {
                error!(run_id = %run_id, "Run failed: {:#}", e);
                "failed"
            }
        };
        let phase = if summary.interrupted {
            Phase::RunInterrupted
        } else {
            Phase::RunFinished
        };
        self.append(&manifest, phase, NewEntry::run(run_id, status))
            .await;

        outcome?;
        info!(
            run_id = %run_id,
            integrated = summary.integrated.len(),
            preserved = summary.preserved_branches.len(),
            left_in_place = summary.left_in_place.len(),
            "Run {}", status
        );
        Ok(summary)
    }

    /// Returns `Ok(false)` once every pending group has been processed and
    /// `Ok(true)` when `stop` cut the run short.
    async fn drive(
        &self,
        ctx: &RunContext<'_>,
        progress: &Mutex<RunSummary>,
        stop: watch::Receiver<bool>,
    ) -> Result<bool> {
        let settings = &self.settings;
        let workspaces = WorkspaceManager::new(
            self.git.clone(),
            settings.worktrees_dir(),
            ctx.run_id,
            ctx.base_revision,
        );
        let mut scheduler = Scheduler::new(
            self.git.clone(),
            workspaces,
            Arc::clone(&ctx.agent),
            ctx.manifest.clone(),
            ctx.run_id,
            settings.logs_dir(ctx.run_id),
            settings.agent_timeout,
            ctx.active.clone(),
        )
        .with_stop(stop.clone());
        let integrator = Integrator {
            git: &self.git,
            manifest: ctx.manifest,
            tasks: ctx.store,
            run_id: ctx.run_id,
            base_revision: ctx.base_revision,
            target_line: ctx.target_line,
        };

        let groups = ctx.store.pending_groups()?;
        if groups.is_empty() {
            info!("No pending tasks");
        }
        for group in groups {
            if *stop.borrow() {
                return Ok(true);
            }
            let tasks = ctx.store.tasks_by_group(group)?;
            if tasks.is_empty() {
                continue;
            }
            let run = scheduler
                .run_group(group, &tasks, settings.max_parallel)
                .await?;
            let jobs = run.jobs;
            if run.interrupted {
                warn!(group = %group, finished = jobs.len(), "Group interrupted before integration");
                // Finished work is not merged; its branches stay for the operator.
                let preserved = jobs
                    .iter()
                    .filter(|job| job.outcome == JobOutcome::Success && !job.left_in_place())
                    .map(|job| job.branch.clone())
                    .collect();
                if let Ok(mut summary) = progress.lock() {
                    summary.absorb(GroupSummary {
                        group,
                        jobs,
                        integration: IntegrationReport {
                            preserved,
                            ..Default::default()
                        },
                    });
                }
                return Ok(true);
            }
            let integration = integrator.integrate(group, &jobs).await?;
            info!(
                group = %group,
                merged = integration.merged.len(),
                preserved = integration.preserved.len(),
                "Group integrated"
            );
            if let Ok(mut summary) = progress.lock() {
                summary.absorb(GroupSummary {
                    group,
                    jobs,
                    integration,
                });
            }
        }
        Ok(false)
    }

    async fn append(&self, manifest: &Manifest, phase: Phase, entry: NewEntry) {
        if let Err(e) = manifest.append(phase, entry).await {
            warn!("Failed to append {} to manifest: {}", phase.as_str(), e);
        }
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let settings = &self.settings;
        let lock = RunLock::inspect(&settings.state_dir)?.map(|owner| LockStatus {
            alive: owner.is_alive(),
            age_secs: owner.age().as_secs(),
            stale: owner.is_stale(settings.stale_after),
            owner,
        });

        let store = TaskStore::open(&settings.task_file);
        let mut pending = Vec::new();
        let mut task_source_error = None;
        match store.pending_groups() {
            Ok(groups) => {
                for group in groups {
                    let ids = store.tasks_by_group(group)?.iter().map(|t| t.id).collect();
                    pending.push(GroupPending {
                        group,
                        pending: ids,
                    });
                }
            }
            Err(e) => task_source_error = Some(format!("{:#}", e)),
        }

        let recent_runs = if settings.state_dir.join(MANIFEST_DB).exists() {
            Manifest::open(&settings.state_dir).await?.recent_runs(5).await?
        } else {
            Vec::new()
        };

        Ok(StatusReport {
            lock,
            pending,
            recent_runs,
            workspaces: list_slots(&settings.worktrees_dir()).await?,
            task_source_error,
        })
    }

    /// Remove workspaces not tied to a live run. Workspaces with residue are
    /// only removed with `force`.
    pub async fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        let settings = &self.settings;
        let mut report = CleanupReport::default();
        let active_run = RunLock::inspect(&settings.state_dir)?
            .filter(|owner| owner.is_alive())
            .map(|owner| owner.run_id);

        self.git.prune_worktrees().await?;
        let registered = self.git.list_worktrees().await?;

        for slot in list_slots(&settings.worktrees_dir()).await? {
            let slot_path = canonical(&slot);
            let entry = registered.iter().find(|w| canonical(&w.path) == slot_path);

            if let Some(run_id) = &active_run {
                let branch = entry.and_then(|e| e.branch.as_deref());
                if slot_run(&slot) == Some(run_id.as_str())
                    || branch.is_some_and(|b| b.starts_with(&format!("convoy/{}/", run_id)))
                {
                    report.skipped_active.push(slot);
                    continue;
                }
            }

            if entry.is_none() {
                if force {
                    tokio::fs::remove_dir_all(&slot)
                        .await
                        .with_context(|| format!("cannot remove {}", slot.display()))?;
                    report.removed.push(slot);
                } else {
                    warn!(path = %slot.display(), "Not a registered worktree; keeping it");
                    report.kept_with_residue.push(slot);
                }
                continue;
            }

            match workspace::reclaim_worktree(&self.git, &slot).await? {
                Reclaim::Cleaned => {
                    info!(path = %slot.display(), "Removed orphaned workspace");
                    report.removed.push(slot);
                }
                Reclaim::LeftInPlace if force => {
                    self.git.remove_worktree(&slot, true).await?;
                    warn!(path = %slot.display(), "Force-removed workspace with residue");
                    report.removed.push(slot);
                }
                Reclaim::LeftInPlace => report.kept_with_residue.push(slot),
            }
        }
        self.git.prune_worktrees().await?;
        for dir in run_dirs(&settings.worktrees_dir()).await? {
            // Only succeeds once every slot of that run is gone.
            let _ = tokio::fs::remove_dir(&dir).await;
        }
        Ok(report)
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Run id of a `<worktrees>/<run_id>/<job_id>` slot.
fn slot_run(slot: &Path) -> Option<&str> {
    slot.parent()?.file_name()?.to_str()
}

async fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Per-run directories under `worktrees`; a worktree sitting directly there is not one.
async fn run_dirs(worktrees: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for dir in subdirs(worktrees).await? {
        if !dir.join(".git").exists() {
            dirs.push(dir);
        }
    }
    Ok(dirs)
}

/// Every workspace slot, `<worktrees>/<run_id>/<job_id>`. Worktrees placed
/// directly under `worktrees` are listed as well.
async fn list_slots(worktrees: &Path) -> Result<Vec<PathBuf>> {
    let mut slots = Vec::new();
    for dir in subdirs(worktrees).await? {
        if dir.join(".git").exists() {
            slots.push(dir);
        } else {
            slots.extend(subdirs(&dir).await?);
        }
    }
    slots.sort();
    Ok(slots)
}

#[cfg(test)]
mod tests;
