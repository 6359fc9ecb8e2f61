use super::settings;
use crate::core::lock::{LockOwner, RunLock};
use crate::core::orchestrator::Orchestrator;
use crate::core::test_support::{ScriptedAgent, git, init_repo};

async fn run_error(root: &std::path::Path) -> String {
    let orchestrator = Orchestrator::new(settings(root, 2));
    let err = orchestrator.run(ScriptedAgent::new()).await.unwrap_err();
    format!("{:#}", err)
}

#[tokio::test]
async fn missing_task_document_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path(), &[]);
    assert!(run_error(tmp.path()).await.contains("no task source"));
    assert!(RunLock::inspect(&tmp.path().join(".convoy")).unwrap().is_none());
}

#[tokio::test]
async fn untracked_task_document_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path(), &[]);
    std::fs::write(tmp.path().join("TASKS.md"), "- [ ] a\n").unwrap();
    assert!(run_error(tmp.path()).await.contains("not tracked"));
}

#[tokio::test]
async fn uncommitted_task_document_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path(), &[("TASKS.md", "- [ ] a\n")]);
    std::fs::write(tmp.path().join("TASKS.md"), "- [ ] a\n- [ ] b\n").unwrap();
    assert!(run_error(tmp.path()).await.contains("uncommitted changes"));
}

#[tokio::test]
async fn detached_head_needs_an_integration_branch() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path(), &[("TASKS.md", "- [ ] a\n")]);
    git(tmp.path(), &["checkout", "-q", "--detach"]);
    assert!(run_error(tmp.path()).await.contains("detached"));
}

#[tokio::test]
async fn live_lock_holder_blocks_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path(), &[("TASKS.md", "- [ ] a\n")]);
    let state_dir = tmp.path().join(".convoy");
    std::fs::create_dir_all(&state_dir).unwrap();
    let holder = LockOwner {
        owner_pid: std::process::id(),
        owner_host: "here".to_string(),
        run_id: "busy-run".to_string(),
        created_at: 0,
    };
    std::fs::write(
        RunLock::path(&state_dir),
        serde_json::to_string(&holder).unwrap(),
    )
    .unwrap();

    let message = run_error(tmp.path()).await;
    assert!(message.contains("another run holds the lock"));
    assert!(message.contains("busy-run"));
    assert_eq!(RunLock::inspect(&state_dir).unwrap(), Some(holder));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_lock_is_reclaimed_and_recorded() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path(), &[("TASKS.md", "- [ ] a\n")]);
    let state_dir = tmp.path().join(".convoy");
    std::fs::create_dir_all(&state_dir).unwrap();
    let dead = LockOwner {
        owner_pid: 99_999_999,
        owner_host: "gone".to_string(),
        run_id: "crashed-run".to_string(),
        created_at: 0,
    };
    std::fs::write(RunLock::path(&state_dir), serde_json::to_string(&dead).unwrap()).unwrap();

    let orchestrator = Orchestrator::new(settings(tmp.path(), 1));
    let summary = orchestrator.run(ScriptedAgent::new()).await.unwrap();
    assert_eq!(summary.reclaimed_lock, Some(dead));
    assert_eq!(summary.integrated.len(), 1);
    assert!(RunLock::inspect(&state_dir).unwrap().is_none());
}
