mod preflight;
mod scenarios;

use std::path::Path;
use std::time::Duration;

use crate::core::config::RunSettings;
use crate::core::test_support::{AUTHOR, EMAIL};

pub(super) fn settings(root: &Path, max_parallel: usize) -> RunSettings {
    RunSettings {
        repo_root: root.to_path_buf(),
        task_file: root.join("TASKS.md"),
        state_dir: root.join(".convoy"),
        max_parallel,
        integration_branch: None,
        agent_command: None,
        agent_timeout: Some(Duration::from_secs(20)),
        stale_after: Duration::from_secs(45 * 60),
        author_name: AUTHOR.to_string(),
        author_email: EMAIL.to_string(),
    }
}
