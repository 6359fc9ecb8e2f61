use anyhow::Result;
use console::style;

use super::{CommonFlags, load_settings, overrides_for};
use crate::core::orchestrator::{Orchestrator, StatusReport};
use crate::core::terminal::{GuideSection, print_error, print_info};

pub async fn status_command(flags: CommonFlags) -> Result<()> {
    let (settings, _) = load_settings(&overrides_for(&flags)).await?;
    let orchestrator = Orchestrator::new(settings);
    let report = orchestrator.status().await?;

    if flags.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render(&report);
    }
    Ok(())
}

fn render(report: &StatusReport) {
    let mut lock = GuideSection::new("Lock");
    match &report.lock {
        Some(status) => {
            let state = if status.alive {
                style("alive").green().to_string()
            } else if status.stale {
                style("stale, will be reclaimed").yellow().to_string()
            } else {
                style("owner gone").yellow().to_string()
            };
            lock = lock
                .status("run", &status.owner.run_id)
                .status(
                    "owner",
                    &format!("pid {} on {}", status.owner.owner_pid, status.owner.owner_host),
                )
                .status("age", &format!("{}s", status.age_secs))
                .status("state", &state);
        }
        None => lock = lock.text("free"),
    }
    lock.print();

    let mut pending = GuideSection::new("Pending tasks");
    if let Some(error) = &report.task_source_error {
        pending = pending.text(&style(error).red().to_string());
    } else if report.pending.is_empty() {
        pending = pending.text("none");
    }
    for group in &report.pending {
        let ids: Vec<String> = group.pending.iter().map(|id| id.to_string()).collect();
        pending = pending.status(&format!("group {}", group.group), &ids.join(", "));
    }
    pending.print();

    let mut runs = GuideSection::new("Recent runs");
    if report.recent_runs.is_empty() {
        runs = runs.text("none recorded");
    }
    for run in &report.recent_runs {
        let state = if run.finished { "finished" } else { run.last_phase.as_str() };
        runs = runs.status(
            &run.run_id,
            &format!(
                "{}, jobs {}/{}, merged {}, last event {}",
                state, run.jobs_finished, run.jobs_started, run.merged, run.last_event_at
            ),
        );
    }
    runs.print();
    println!();

    if !report.workspaces.is_empty() {
        print_info(&format!(
            "{} workspace(s) on disk; `convoy cleanup` removes orphaned ones",
            report.workspaces.len()
        ));
        for path in &report.workspaces {
            println!("   {}", style(path.display()).dim());
        }
    }
    if report.task_source_error.is_some() {
        print_error("Task document could not be read");
    }
}
