use std::time::Duration;

use super::settings;
use crate::core::lock::RunLock;
use crate::core::manifest::{Manifest, ManifestEntry, ManifestQuery};
use crate::core::orchestrator::{JobOutcome, Orchestrator};
use crate::core::tasks::{TaskId, TaskStore};
use crate::core::test_support::{ScriptedAgent, branches, git, head, init_repo};

async fn manifest_entries(root: &std::path::Path, run_id: &str) -> Vec<ManifestEntry> {
    Manifest::open(&root.join(".convoy"))
        .await
        .unwrap()
        .entries(&ManifestQuery {
            run_id: Some(run_id.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn first<'a>(entries: &'a [ManifestEntry], phase: &str, job: &str) -> &'a ManifestEntry {
    entries
        .iter()
        .find(|e| e.phase == phase && e.job_id.as_deref() == Some(job))
        .unwrap_or_else(|| panic!("no {} entry for {}", phase, job))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn groups_run_in_order_with_bounded_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(
        root,
        &[(
            "TASKS.md",
            "# Plan\n\
             - [ ] second group a [group: 2]\n\
             - [ ] first group a [group: 1]\n\
             - [ ] first group b [group: 1]\n\
             - [ ] second group b [group: 2]\n\
             - [ ] first group c [group: 1]\n",
        )],
    );
    let base = head(root);
    let agent = ScriptedAgent::new();
    let orchestrator = Orchestrator::new(settings(root, 2));

    let summary = orchestrator.run(agent.clone()).await.unwrap();
    assert!(!summary.interrupted);
    assert_eq!(summary.base_revision, base);
    assert_eq!(summary.target_line, "main");
    assert_eq!(summary.succeeded, 5);
    assert_eq!(
        summary.integrated,
        vec![TaskId(2), TaskId(3), TaskId(5), TaskId(1), TaskId(4)]
    );
    assert!(summary.preserved_branches.is_empty());
    assert_eq!(agent.peak(), 2);

    // Group 1 was split 2 + 1 and fully integrated before group 2 started.
    let entries = manifest_entries(root, &summary.run_id).await;
    assert!(first(&entries, "job_provisioned", "job-3").id > first(&entries, "job_finished", "job-2").id);
    let last_group1_merge = entries
        .iter()
        .filter(|e| e.phase == "merge" && e.group.as_deref() == Some("1"))
        .map(|e| e.id)
        .max()
        .unwrap();
    let first_group2_job = entries
        .iter()
        .filter(|e| e.phase == "job_provisioned" && e.group.as_deref() == Some("2"))
        .map(|e| e.id)
        .min()
        .unwrap();
    assert!(last_group1_merge < first_group2_job);

    // Every job started from the same baseline.
    assert!(entries
        .iter()
        .filter(|e| e.phase == "job_provisioned")
        .all(|e| e.base_revision.as_deref() == Some(base.as_str())));
    assert!(agent.started().iter().all(|(_, rev)| *rev == base));

    // Every completed task has a successful merge on record.
    let store = TaskStore::open(root.join("TASKS.md"));
    for task in store.tasks().unwrap() {
        assert!(!task.is_pending());
        assert!(entries.iter().any(|e| e.phase == "merge"
            && e.status == "success"
            && e.task_id.as_deref() == Some(task.id.to_string().as_str())));
        assert!(root.join(format!("{}.txt", task.id)).exists());
    }
    assert!(branches(root).iter().all(|b| !b.starts_with("convoy/")));
    assert!(RunLock::inspect(&root.join(".convoy")).unwrap().is_none());
    assert_eq!(entries.last().unwrap().phase, "run_finished");
    assert_eq!(git(root, &["status", "--porcelain"]), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_without_commits_leaves_task_pending() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root, &[("TASKS.md", "- [ ] nothing to change\n- [ ] real work\n")]);
    let orchestrator = Orchestrator::new(settings(root, 2));

    let summary = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    assert_eq!(summary.no_commits, 1);
    assert_eq!(summary.integrated, vec![TaskId(2)]);

    let job = &summary.groups[0].jobs[0];
    assert_eq!(job.outcome, JobOutcome::NoCommits);
    assert!(job.branch_deleted);
    assert!(!branches(root).contains(&job.branch));

    let store = TaskStore::open(root.join("TASKS.md"));
    assert!(store.task(TaskId(1)).unwrap().is_pending());
    assert!(!store.task(TaskId(2)).unwrap().is_pending());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_branch_is_preserved_and_later_jobs_integrate() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(
        root,
        &[(
            "TASKS.md",
            "- [ ] conflict left\n- [ ] conflict right\n- [ ] unrelated\n",
        )],
    );
    let orchestrator = Orchestrator::new(settings(root, 3));

    let summary = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    let conflicted = format!("convoy/{}/job-2-task-2", summary.run_id);
    assert_eq!(summary.preserved_branches, vec![conflicted.clone()]);
    assert_eq!(summary.integrated, vec![TaskId(1), TaskId(3)]);
    assert!(branches(root).contains(&conflicted));

    let store = TaskStore::open(root.join("TASKS.md"));
    assert!(store.task(TaskId(2)).unwrap().is_pending());
    assert!(!root.join(".git/MERGE_HEAD").exists());
    assert_eq!(
        std::fs::read_to_string(root.join("shared.txt")).unwrap(),
        "conflict left\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn residue_is_integrated_but_kept_and_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root, &[("TASKS.md", "- [ ] work with residue\n")]);
    let orchestrator = Orchestrator::new(settings(root, 1));

    let summary = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    let job = &summary.groups[0].jobs[0];
    assert_eq!(job.outcome, JobOutcome::Success);
    assert!(job.left_in_place());
    assert_eq!(summary.integrated, vec![TaskId(1)]);
    assert_eq!(summary.left_in_place, vec![job.workspace.clone()]);
    assert_eq!(summary.preserved_branches, vec![job.branch.clone()]);
    assert!(branches(root).contains(&job.branch));
    assert!(job.workspace.join("scratch.tmp").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rerun_keeps_workspaces_an_earlier_run_left_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root, &[("TASKS.md", "- [ ] fail with residue\n")]);
    let orchestrator = Orchestrator::new(settings(root, 1));

    let first_run = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    assert_eq!(first_run.groups[0].jobs[0].outcome, JobOutcome::Error);
    let kept = first_run.left_in_place[0].clone();
    std::fs::write(kept.join("operator-notes.txt"), "looked at this").unwrap();

    let second = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    assert_ne!(second.left_in_place[0], kept);
    assert!(kept.join("scratch.tmp").exists());
    assert_eq!(
        std::fs::read_to_string(kept.join("operator-notes.txt")).unwrap(),
        "looked at this"
    );
    let workspaces = orchestrator.status().await.unwrap().workspaces;
    assert_eq!(workspaces.len(), 2);
    assert!(workspaces.contains(&kept));
    assert!(workspaces.contains(&second.left_in_place[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_run_integrates_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root, &[("TASKS.md", "- [ ] one\n- [ ] two [group: 1]\n")]);
    let orchestrator = Orchestrator::new(settings(root, 2));

    let first_run = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    assert_eq!(first_run.integrated.len(), 2);
    let after_first = head(root);

    let agent = ScriptedAgent::new();
    let second = orchestrator.run(agent.clone()).await.unwrap();
    assert!(second.integrated.is_empty());
    assert!(second.groups.is_empty());
    assert!(agent.started().is_empty());
    assert_eq!(head(root), after_first);

    let entries = manifest_entries(root, &second.run_id).await;
    assert!(entries.iter().all(|e| e.phase != "job_provisioned"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn integration_branch_leaves_the_original_line_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root, &[("TASKS.md", "- [ ] feature\n")]);
    let base = head(root);
    let mut config = settings(root, 1);
    config.integration_branch = Some("convoy/integration".to_string());
    let orchestrator = Orchestrator::new(config);

    let summary = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    assert_eq!(summary.target_line, "convoy/integration");
    assert_eq!(summary.integrated, vec![TaskId(1)]);
    assert_eq!(git(root, &["rev-parse", "main"]), base);
    assert_ne!(git(root, &["rev-parse", "convoy/integration"]), base);

    // Reusing the branch name is refused.
    let err = orchestrator.run(ScriptedAgent::new()).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interruption_reports_workspaces_and_releases_the_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root, &[("TASKS.md", "- [ ] hang around\n")]);
    let orchestrator = Orchestrator::new(settings(root, 1));

    let summary = orchestrator
        .run_until(
            ScriptedAgent::new(),
            tokio::time::sleep(Duration::from_millis(800)),
        )
        .await
        .unwrap();
    assert!(summary.interrupted);
    let slot = root
        .join(".convoy/worktrees")
        .join(&summary.run_id)
        .join("job-1");
    assert_eq!(summary.left_in_place, vec![slot.clone()]);
    assert!(slot.exists());
    assert!(RunLock::inspect(&root.join(".convoy")).unwrap().is_none());

    let entries = manifest_entries(root, &summary.run_id).await;
    assert_eq!(entries.last().unwrap().phase, "run_interrupted");
    let store = TaskStore::open(root.join("TASKS.md"));
    assert!(store.task(TaskId(1)).unwrap().is_pending());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupt_during_integration_lets_the_group_finish_merging() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(
        root,
        &[(
            "TASKS.md",
            "- [ ] first group a [group: 1]\n\
             - [ ] first group b [group: 1]\n\
             - [ ] later work [group: 2]\n",
        )],
    );
    let base = head(root);
    let orchestrator = Orchestrator::new(settings(root, 2));

    // Fires as soon as the first merge lands on the target line.
    let watched = root.to_path_buf();
    let first_merge = async move {
        while head(&watched) == base {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let summary = orchestrator
        .run_until(ScriptedAgent::new(), first_merge)
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.integrated, vec![TaskId(1), TaskId(2)]);
    let store = TaskStore::open(root.join("TASKS.md"));
    assert!(!store.task(TaskId(1)).unwrap().is_pending());
    assert!(!store.task(TaskId(2)).unwrap().is_pending());
    assert!(store.task(TaskId(3)).unwrap().is_pending());
    assert!(!root.join(format!("{}.txt", TaskId(3))).exists());

    // No half-done merge and the task document is committed.
    assert!(!root.join(".git/MERGE_HEAD").exists());
    assert_eq!(git(root, &["status", "--porcelain"]), "");
    assert!(RunLock::inspect(&root.join(".convoy")).unwrap().is_none());
    let entries = manifest_entries(root, &summary.run_id).await;
    assert_eq!(entries.last().unwrap().phase, "run_interrupted");
}

#[tokio::test]
async fn dry_run_plan_uses_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    std::fs::write(
        root.join("TASKS.md"),
        "- [ ] a [group: 1]\n- [ ] b [group: 1]\n- [ ] c [group: 1]\n- [x] d\n- [ ] e\n",
    )
    .unwrap();
    let orchestrator = Orchestrator::new(settings(root, 2));
    let plan = orchestrator.plan().unwrap();
    assert_eq!(plan.len(), 2);
    assert_eq!(
        plan[0].batches,
        vec![vec![TaskId(1), TaskId(2)], vec![TaskId(3)]]
    );
    assert_eq!(plan[1].batches, vec![vec![TaskId(5)]]);
    assert!(!root.join(".convoy").exists());
}
