//! Thin async wrapper over the `git` CLI for the primitives the orchestrator
//! depends on: worktrees, branches, commit counts, merges.

use anyhow::{Context, Result, bail};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Merged,
    Conflict { files: Vec<String> },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    author_name: String,
    author_email: String,
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>, author_name: &str, author_email: &str) -> Self {
        Self {
            root: root.into(),
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
        }
    }

    /// Top-level directory of the repository containing `dir`.
    pub async fn discover(dir: &Path) -> Result<PathBuf> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .output()
            .await
            .context("failed to run git; is it installed?")?;
        if !output.status.success() {
            bail!("{} is not inside a git repository", dir.display());
        }
        Ok(PathBuf::from(stdout_of(&output)))
    }

    async fn raw<I, S>(&self, dir: &Path, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .arg("-c")
            .arg("commit.gpgsign=false")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_MERGE_AUTOEDIT", "no")
            .kill_on_drop(true);
        let output = cmd.output().await.context("failed to run git")?;
        Ok(output)
    }

    async fn run<I, S>(&self, dir: &Path, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let output = self.raw(dir, &args).await?;
        if !output.status.success() {
            let rendered = args
                .iter()
                .map(|a| a.as_ref().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            bail!("git {} failed: {}", rendered, stderr_of(&output));
        }
        Ok(stdout_of(&output))
    }

    pub async fn head_revision(&self) -> Result<String> {
        self.run(&self.root, ["rev-parse", "HEAD"]).await
    }

    /// Short name of the checked-out branch, `None` when HEAD is detached.
    pub async fn current_branch(&self) -> Result<Option<String>> {
        let output = self
            .raw(&self.root, ["symbolic-ref", "--short", "-q", "HEAD"])
            .await?;
        if output.status.success() {
            Ok(Some(stdout_of(&output)))
        } else {
            Ok(None)
        }
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", name);
        let output = self
            .raw(&self.root, ["show-ref", "--verify", "--quiet", reference.as_str()])
            .await?;
        Ok(output.status.success())
    }

    pub async fn create_branch(&self, name: &str, at: &str) -> Result<()> {
        self.run(&self.root, ["branch", name, at]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.run(&self.root, ["branch", "-D", name]).await?;
        Ok(())
    }

    pub async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        self.run(
            &self.root,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("-b"),
                OsStr::new(branch),
                path.as_os_str(),
                OsStr::new(base),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn remove_worktree(&self, path: &Path, force: bool) -> Result<()> {
        let mut args = vec![OsStr::new("worktree"), OsStr::new("remove")];
        if force {
            args.push(OsStr::new("--force"));
        }
        args.push(path.as_os_str());
        self.run(&self.root, args).await?;
        Ok(())
    }

    pub async fn prune_worktrees(&self) -> Result<()> {
        self.run(&self.root, ["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let text = self
            .run(&self.root, ["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&text))
    }

    /// Staged, unstaged or untracked changes in `dir`.
    pub async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool> {
        let status = self.run(dir, ["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    /// Commits reachable from `branch` but not from `base`.
    pub async fn commit_count(&self, base: &str, branch: &str) -> Result<u32> {
        let range = format!("{}..{}", base, branch);
        let count = self
            .run(&self.root, ["rev-list", "--count", range.as_str()])
            .await?;
        count
            .parse()
            .with_context(|| format!("unexpected rev-list output '{}'", count))
    }

    pub async fn checkout(&self, line: &str) -> Result<()> {
        self.run(&self.root, ["checkout", "-q", line]).await?;
        Ok(())
    }

    pub async fn merge_in_progress(&self) -> Result<bool> {
        let output = self
            .raw(&self.root, ["rev-parse", "-q", "--verify", "MERGE_HEAD"])
            .await?;
        Ok(output.status.success())
    }

    /// Merge `branch` into the checked-out line. Failures are classified, not
    /// returned as errors; only a failure to launch git is an `Err`.
    pub async fn merge(&self, branch: &str, message: &str) -> Result<MergeAttempt> {
        let output = self
            .raw(
                &self.root,
                ["merge", "--no-ff", "--no-edit", "-m", message, branch],
            )
            .await?;
        if output.status.success() {
            return Ok(MergeAttempt::Merged);
        }

        let unmerged = self
            .run(&self.root, ["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap_or_default();
        let files: Vec<String> = unmerged
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if !files.is_empty() {
            return Ok(MergeAttempt::Conflict { files });
        }

        let mut message = stderr_of(&output);
        if message.is_empty() {
            message = stdout_of(&output);
        }
        Ok(MergeAttempt::Failed { message })
    }

    pub async fn abort_merge(&self) -> Result<()> {
        self.run(&self.root, ["merge", "--abort"]).await?;
        Ok(())
    }

    pub async fn is_tracked(&self, path: &Path) -> Result<bool> {
        let output = self
            .raw(
                &self.root,
                [
                    OsStr::new("ls-files"),
                    OsStr::new("--error-unmatch"),
                    OsStr::new("--"),
                    path.as_os_str(),
                ],
            )
            .await?;
        Ok(output.status.success())
    }

    /// No staged or unstaged modifications to `path`.
    pub async fn path_is_clean(&self, path: &Path) -> Result<bool> {
        let status = self
            .run(
                &self.root,
                [
                    OsStr::new("status"),
                    OsStr::new("--porcelain"),
                    OsStr::new("--"),
                    path.as_os_str(),
                ],
            )
            .await?;
        Ok(status.is_empty())
    }

    /// Stage and commit exactly the given paths.
    pub async fn commit_paths(&self, paths: &[&Path], message: &str) -> Result<()> {
        let mut add = vec![OsStr::new("add"), OsStr::new("--")];
        add.extend(paths.iter().map(|p| p.as_os_str()));
        self.run(&self.root, add).await?;

        let mut commit = vec![
            OsStr::new("commit"),
            OsStr::new("-q"),
            OsStr::new("-m"),
            OsStr::new(message),
            OsStr::new("--"),
        ];
        commit.extend(paths.iter().map(|p| p.as_os_str()));
        self.run(&self.root, commit).await?;
        debug!(paths = paths.len(), "committed task state");
        Ok(())
    }
}

fn parse_worktree_list(text: &str) -> Vec<WorktreeEntry> {
    let mut out = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in text.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                out.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch ")
            && let Some(entry) = current.as_mut()
        {
            entry.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        }
    }
    if let Some(entry) = current {
        out.push(entry);
    }
    out
}
