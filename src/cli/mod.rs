mod cleanup;
mod run;
mod status;
mod tasks;

use anyhow::{Result, anyhow, bail};
use console::style;
use std::path::{Path, PathBuf};

use crate::core::config::{ConvoyConfig, RunOverrides, RunSettings, resolve_run_settings};
use crate::core::git::GitRepo;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Run")
        .command("run", "Execute pending tasks in parallel and integrate the results")
        .command("status", "Show the lock holder, pending tasks and recent runs")
        .command("cleanup", "Remove orphaned workspaces from earlier runs")
        .print();

    GuideSection::new("Tasks")
        .command("tasks", "List tasks by group")
        .command("task done <N>", "Mark task N complete")
        .command("task reopen <N>", "Mark task N pending again")
        .print();

    GuideSection::new("Run options")
        .text("--tasks <path>               Task document (default: TASKS.md)")
        .text("--max-parallel <n>           Concurrent jobs per batch")
        .text("--integration-branch <name>  Merge into a fresh branch instead of the current one")
        .text("--agent <command>            Shell command run in each workspace, task as $1")
        .text("--timeout <secs>             Per-agent time limit, 0 for none")
        .text("--dry-run                    Print the batch plan and exit")
        .text("--json                       Machine-readable output")
        .text("--verbose, -v                Debug logging (or set CONVOY_LOG)")
        .blank()
        .hint("convoy run --max-parallel 4 --agent './agent.sh \"$1\"'", "")
        .hint("convoy run --dry-run", "")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("convoy").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RunFlags {
    pub overrides: RunOverrides,
    pub dry_run: bool,
    pub json: bool,
    pub verbose: bool,
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} needs a value", flag))
}

pub(crate) fn parse_run_flags(args: &[String], start: usize) -> Result<RunFlags> {
    let mut flags = RunFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--tasks" => {
                flags.overrides.task_file = Some(PathBuf::from(flag_value(args, i, "--tasks")?));
                i += 2;
            }
            "--max-parallel" | "-j" => {
                let value = flag_value(args, i, "--max-parallel")?;
                flags.overrides.max_parallel = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow!("--max-parallel expects a number, got '{}'", value))?,
                );
                i += 2;
            }
            "--integration-branch" => {
                flags.overrides.integration_branch =
                    Some(flag_value(args, i, "--integration-branch")?.to_string());
                i += 2;
            }
            "--agent" => {
                flags.overrides.agent_command = Some(flag_value(args, i, "--agent")?.to_string());
                i += 2;
            }
            "--timeout" => {
                let value = flag_value(args, i, "--timeout")?;
                flags.overrides.timeout_secs = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow!("--timeout expects seconds, got '{}'", value))?,
                );
                i += 2;
            }
            "--dry-run" => {
                flags.dry_run = true;
                i += 1;
            }
            "--json" => {
                flags.json = true;
                i += 1;
            }
            "--verbose" | "-v" => {
                flags.verbose = true;
                i += 1;
            }
            other => bail!("unknown option for run: {}", other),
        }
    }
    Ok(flags)
}

/// `--tasks <path>` plus boolean switches shared by the smaller commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommonFlags {
    pub task_file: Option<PathBuf>,
    pub json: bool,
    pub force: bool,
    pub verbose: bool,
    pub positional: Vec<String>,
}

pub(crate) fn parse_common_flags(args: &[String], start: usize) -> Result<CommonFlags> {
    let mut flags = CommonFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--tasks" => {
                flags.task_file = Some(PathBuf::from(flag_value(args, i, "--tasks")?));
                i += 2;
            }
            "--json" => {
                flags.json = true;
                i += 1;
            }
            "--force" | "-f" => {
                flags.force = true;
                i += 1;
            }
            "--verbose" | "-v" => {
                flags.verbose = true;
                i += 1;
            }
            other if other.starts_with('-') => bail!("unknown option: {}", other),
            other => {
                flags.positional.push(other.to_string());
                i += 1;
            }
        }
    }
    Ok(flags)
}

/// Repository root for `dir`, falling back to `dir` itself outside git.
pub(crate) async fn project_root(dir: &Path) -> PathBuf {
    GitRepo::discover(dir)
        .await
        .unwrap_or_else(|_| dir.to_path_buf())
}

/// Settings for the repository containing the working directory, plus the
/// parallelism advisory if any.
pub(crate) async fn load_settings(
    overrides: &RunOverrides,
) -> Result<(RunSettings, Option<String>)> {
    let cwd = std::env::current_dir()?;
    let root = project_root(&cwd).await;
    let config = ConvoyConfig::load(&root).await?;
    Ok(resolve_run_settings(&root, &config, overrides))
}

fn overrides_for(flags: &CommonFlags) -> RunOverrides {
    RunOverrides {
        task_file: flags.task_file.clone(),
        ..Default::default()
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "run" => {
            let flags = parse_run_flags(&args, 2)?;
            crate::logging::init(flags.verbose);
            run::run_command(flags).await
        }
        "status" => {
            let flags = parse_common_flags(&args, 2)?;
            crate::logging::init(flags.verbose);
            status::status_command(flags).await
        }
        "cleanup" => {
            let flags = parse_common_flags(&args, 2)?;
            crate::logging::init(flags.verbose);
            cleanup::cleanup_command(flags).await
        }
        "tasks" => {
            let flags = parse_common_flags(&args, 2)?;
            crate::logging::init(flags.verbose);
            tasks::list_command(flags).await
        }
        "task" => {
            let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
            let flags = parse_common_flags(&args, 3)?;
            crate::logging::init(flags.verbose);
            match sub_cmd {
                "done" | "complete" => tasks::mark_command(flags, true).await,
                "reopen" | "undo" => tasks::mark_command(flags, false).await,
                _ => {
                    GuideSection::new("convoy task")
                        .command("done <N>", "Mark task N complete")
                        .command("reopen <N>", "Mark task N pending again")
                        .print();
                    println!();
                    Ok(())
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
