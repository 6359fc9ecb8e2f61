use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE: &str = "convoy.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Task document, relative to the repository root.
    #[serde(default = "default_task_file")]
    pub task_file: PathBuf,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Orchestrator state (lock, manifest, logs, worktrees), relative to the repository root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// When set, every run integrates into a fresh branch of this name instead
    /// of the branch checked out at run start.
    #[serde(default)]
    pub integration_branch: Option<String>,

    #[serde(default = "default_parallelism_warn_threshold")]
    pub parallelism_warn_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_stale_after_mins")]
    pub stale_after_mins: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Shell command run inside each workspace; the task description is `$1`.
    #[serde(default)]
    pub command: Option<String>,

    /// Upper bound for a single agent invocation. 0 disables the limit.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_task_file() -> PathBuf {
    PathBuf::from("TASKS.md")
}
fn default_max_parallel() -> usize {
    3
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".convoy")
}
fn default_parallelism_warn_threshold() -> usize {
    8
}
fn default_stale_after_mins() -> u64 {
    45
}
fn default_timeout_secs() -> u64 {
    3600
}
fn default_author_name() -> String {
    "convoy".to_string()
}
fn default_author_email() -> String {
    "convoy@localhost".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            task_file: default_task_file(),
            max_parallel: default_max_parallel(),
            state_dir: default_state_dir(),
            integration_branch: None,
            parallelism_warn_threshold: default_parallelism_warn_threshold(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_mins: default_stale_after_mins(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

impl ConvoyConfig {
    pub async fn load<P: AsRef<Path>>(repo_root: P) -> Result<Self> {
        let config_path = repo_root.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config: ConvoyConfig = toml::from_str(&content)
            .with_context(|| format!("invalid {}", config_path.display()))?;
        info!(
            "Loaded {}: task_file={}, max_parallel={}, state_dir={}",
            CONFIG_FILE,
            config.run.task_file.display(),
            config.run.max_parallel,
            config.run.state_dir.display()
        );
        Ok(config)
    }
}

/// Values given on the command line; `None` falls back to the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub task_file: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub integration_branch: Option<String>,
    pub agent_command: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Effective settings for one run, with paths resolved against the repository root.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub repo_root: PathBuf,
    pub task_file: PathBuf,
    pub state_dir: PathBuf,
    pub max_parallel: usize,
    pub integration_branch: Option<String>,
    pub agent_command: Option<String>,
    pub agent_timeout: Option<Duration>,
    pub stale_after: Duration,
    pub author_name: String,
    pub author_email: String,
}

impl RunSettings {
    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir.join("worktrees")
    }

    pub fn logs_dir(&self, run_id: &str) -> PathBuf {
        self.state_dir.join("logs").join(run_id)
    }
}

pub fn parallelism_advisory(max_parallel: usize, warn_threshold: usize) -> Option<String> {
    if max_parallel > warn_threshold {
        Some(format!(
            "Configured parallelism {} is above recommended threshold {}",
            max_parallel, warn_threshold
        ))
    } else {
        None
    }
}

/// Merge config and overrides: flag, then config file, then built-in default.
/// Returns the settings plus an optional parallelism advisory.
pub fn resolve_run_settings(
    repo_root: &Path,
    config: &ConvoyConfig,
    overrides: &RunOverrides,
) -> (RunSettings, Option<String>) {
    let task_file = overrides
        .task_file
        .clone()
        .unwrap_or_else(|| config.run.task_file.clone());
    let max_parallel = overrides
        .max_parallel
        .unwrap_or(config.run.max_parallel)
        .max(1);
    let timeout_secs = overrides.timeout_secs.unwrap_or(config.agent.timeout_secs);
    let advisory = parallelism_advisory(max_parallel, config.run.parallelism_warn_threshold);

    let settings = RunSettings {
        repo_root: repo_root.to_path_buf(),
        task_file: repo_root.join(task_file),
        state_dir: repo_root.join(&config.run.state_dir),
        max_parallel,
        integration_branch: overrides
            .integration_branch
            .clone()
            .or_else(|| config.run.integration_branch.clone()),
        agent_command: overrides
            .agent_command
            .clone()
            .or_else(|| config.agent.command.clone()),
        agent_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        stale_after: Duration::from_secs(config.lock.stale_after_mins.saturating_mul(60)),
        author_name: config.git.author_name.clone(),
        author_email: config.git.author_email.clone(),
    };
    (settings, advisory)
}
