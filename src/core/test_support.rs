//! Throw-away git repositories for tests.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::core::agent::{AgentExit, JobSpec, WorkAgent};
use crate::core::git::GitRepo;

pub const AUTHOR: &str = "convoy-test";
pub const EMAIL: &str = "convoy-test@localhost";

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-c")
        .arg(format!("user.name={}", AUTHOR))
        .arg("-c")
        .arg(format!("user.email={}", EMAIL))
        .arg("-c")
        .arg("commit.gpgsign=false")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Fresh repository on `main` with one commit containing `files`.
pub fn init_repo(dir: &Path, files: &[(&str, &str)]) {
    git(dir, &["init", "-q", "-b", "main"]);
    std::fs::write(dir.join("README.md"), "scratch\n").unwrap();
    for (name, body) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

pub fn repo(dir: &Path) -> GitRepo {
    GitRepo::new(dir, AUTHOR, EMAIL)
}

pub fn head(dir: &Path) -> String {
    git(dir, &["rev-parse", "HEAD"])
}

pub fn branches(dir: &Path) -> Vec<String> {
    git(dir, &["branch", "--format=%(refname:short)"])
        .lines()
        .map(str::to_string)
        .collect()
}

/// Agent whose behaviour is driven by keywords in the task description:
/// `nothing` exits cleanly without committing, `crash` returns an error,
/// `hang` sleeps past any test timeout, `conflict` commits to a shared file,
/// `residue` leaves an untracked file behind, `fail` commits then exits 1.
/// Anything else commits a file named after the task.
#[derive(Default)]
pub struct ScriptedAgent {
    running: AtomicUsize,
    peak: AtomicUsize,
    started: StdMutex<Vec<(String, String)>>,
}

impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// `(job_id, HEAD of the workspace when the job started)`.
    pub fn started(&self) -> Vec<(String, String)> {
        self.started.lock().unwrap().clone()
    }

    async fn work(&self, job: &JobSpec) -> Result<AgentExit> {
        let text = job.description.as_str();
        let head = git_async(&job.workspace, &["rev-parse", "HEAD"]).await?;
        self.started
            .lock()
            .unwrap()
            .push((job.job_id.clone(), head));
        tokio::time::sleep(Duration::from_millis(150)).await;

        if text.contains("crash") {
            anyhow::bail!("agent blew up");
        }
        if text.contains("hang") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if text.contains("nothing") {
            return Ok(AgentExit { code: Some(0) });
        }

        let file = if text.contains("conflict") {
            "shared.txt".to_string()
        } else {
            format!("{}.txt", job.task_id)
        };
        tokio::fs::write(job.workspace.join(&file), format!("{}\n", text)).await?;
        git_async(&job.workspace, &["add", &file]).await?;
        git_async(&job.workspace, &["commit", "-q", "-m", text]).await?;
        if text.contains("residue") {
            tokio::fs::write(job.workspace.join("scratch.tmp"), "wip").await?;
        }
        let code = if text.contains("fail") { 1 } else { 0 };
        Ok(AgentExit { code: Some(code) })
    }
}

#[async_trait]
impl WorkAgent for ScriptedAgent {
    async fn execute(&self, job: &JobSpec) -> Result<AgentExit> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.work(job).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

async fn git_async(dir: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .arg("-c")
        .arg(format!("user.name={}", AUTHOR))
        .arg("-c")
        .arg(format!("user.email={}", EMAIL))
        .arg("-c")
        .arg("commit.gpgsign=false")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
