use anyhow::{Result, bail};
use console::style;
use std::sync::Arc;
use tracing::warn;
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};

use super::{RunFlags, load_settings};
use crate::core::agent::CommandAgent;
use crate::core::orchestrator::{JobOutcome, Orchestrator, PlannedGroup, RunSummary};
use crate::core::terminal::{
    GuideSection, print_branch, print_info, print_step, print_success, print_warn,
};

pub async fn run_command(flags: RunFlags) -> Result<()> {
    let (settings, advisory) = load_settings(&flags.overrides).await?;
    if let Some(message) = &advisory {
        print_warn(message);
    }
    let orchestrator = Orchestrator::new(settings).with_run_log();

    if flags.dry_run {
        let plan = orchestrator.plan()?;
        if flags.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            render_plan(&plan, orchestrator.settings().max_parallel);
        }
        return Ok(());
    }

    let Some(command) = orchestrator.settings().agent_command.clone() else {
        bail!("no agent command configured; set [agent] command in convoy.toml or pass --agent");
    };
    if !flags.json {
        print_step(&format!(
            "Running pending tasks from {} (max {} in parallel)",
            orchestrator.settings().task_file.display(),
            orchestrator.settings().max_parallel
        ));
    }

    let signals = ShutdownSignals::install();
    let mut summary = orchestrator
        .run_until(Arc::new(CommandAgent::new(command)), signals.recv())
        .await?;
    summary.advisory = advisory;

    if flags.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        render_summary(&summary);
    }
    if summary.interrupted {
        bail!("run {} was interrupted", summary.run_id);
    }
    Ok(())
}

/// Ctrl-C, plus SIGTERM and SIGHUP on unix. Unix handlers are registered on
/// install, so a signal arriving before the run polls `recv` is not lost.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: Option<Signal>,
    #[cfg(unix)]
    terminate: Option<Signal>,
    #[cfg(unix)]
    hangup: Option<Signal>,
}

impl ShutdownSignals {
    fn install() -> Self {
        Self {
            #[cfg(unix)]
            interrupt: unix_handler(SignalKind::interrupt(), "SIGINT"),
            #[cfg(unix)]
            terminate: unix_handler(SignalKind::terminate(), "SIGTERM"),
            #[cfg(unix)]
            hangup: unix_handler(SignalKind::hangup(), "SIGHUP"),
        }
    }

    #[cfg(unix)]
    async fn recv(self) {
        let Self {
            mut interrupt,
            mut terminate,
            mut hangup,
        } = self;
        tokio::select! {
            _ = next_signal(&mut interrupt) => warn!("Received SIGINT"),
            _ = next_signal(&mut terminate) => warn!("Received SIGTERM"),
            _ = next_signal(&mut hangup) => warn!("Received SIGHUP"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
fn unix_handler(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Cannot listen for {}: {}", name, e);
            None
        }
    }
}

#[cfg(unix)]
async fn next_signal(stream: &mut Option<Signal>) {
    match stream {
        Some(stream) => {
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

fn render_plan(plan: &[PlannedGroup], max_parallel: usize) {
    if plan.is_empty() {
        print_info("No pending tasks.");
        return;
    }
    for group in plan {
        let mut section = GuideSection::new(&format!("Group {}", group.group));
        for (i, batch) in group.batches.iter().enumerate() {
            let ids: Vec<String> = batch.iter().map(|id| id.to_string()).collect();
            section = section.status(&format!("batch {}", i + 1), &ids.join(", "));
        }
        section.print();
    }
    println!(
        "\n {}",
        style(format!("Dry run: at most {} jobs at a time.", max_parallel)).dim()
    );
}

fn render_summary(summary: &RunSummary) {
    if let Some(previous) = &summary.reclaimed_lock {
        print_warn(&format!(
            "Reclaimed stale lock from run {} (pid {} on {})",
            previous.run_id, previous.owner_pid, previous.owner_host
        ));
    }
    for group in &summary.groups {
        let mut section = GuideSection::new(&format!("Group {}", group.group));
        for job in &group.jobs {
            let mut line = match job.outcome {
                JobOutcome::Success => format!("{} ({} commits)", job.outcome.as_str(), job.commits),
                _ => job.outcome.as_str().to_string(),
            };
            if let Some(error) = &job.error {
                line.push_str(&format!(": {}", error));
            }
            section = section.status(&format!("{} {}", job.job_id, job.task_id), &line);
        }
        section.print();
    }
    println!();

    if summary.interrupted {
        print_warn(&format!("Run {} interrupted", summary.run_id));
    } else if summary.integrated.is_empty() {
        print_info(&format!("Run {}: nothing integrated", summary.run_id));
    } else {
        print_success(&format!(
            "Run {}: integrated {} task(s) into {}",
            summary.run_id,
            summary.integrated.len(),
            summary.target_line
        ));
    }
    if summary.no_commits > 0 || summary.failed > 0 {
        print_info(&format!(
            "{} without commits, {} failed; those tasks stay pending",
            summary.no_commits, summary.failed
        ));
    }
    for branch in &summary.preserved_branches {
        print_branch("preserved", branch);
    }
    for path in &summary.left_in_place {
        print_warn(&format!("Workspace left in place: {}", path.display()));
    }
    if !summary.left_in_place.is_empty() {
        print_info("Inspect them, then run `convoy cleanup` (add --force to discard residue).");
    }
}
