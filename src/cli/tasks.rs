use anyhow::{Result, bail};
use console::style;

use super::{CommonFlags, load_settings, overrides_for};
use crate::core::tasks::{Group, TaskId, TaskStore};
use crate::core::terminal::{GuideSection, print_info, print_success};

pub async fn list_command(flags: CommonFlags) -> Result<()> {
    let (settings, _) = load_settings(&overrides_for(&flags)).await?;
    let store = TaskStore::open(&settings.task_file);
    let tasks = store.tasks()?;

    if flags.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        print_info(&format!("No tasks in {}", store.path().display()));
        return Ok(());
    }

    let mut groups: Vec<Group> = tasks.iter().map(|t| t.group).collect();
    groups.sort();
    groups.dedup();
    for group in groups {
        let mut section = GuideSection::new(&format!("Group {}", group));
        for task in tasks.iter().filter(|t| t.group == group) {
            let mark = if task.is_pending() {
                style("[ ]").yellow()
            } else {
                style("[x]").green()
            };
            section = section.status(
                &task.id.to_string(),
                &format!("{} {}", mark, task.description),
            );
        }
        section.print();
    }
    println!();
    Ok(())
}

pub async fn mark_command(flags: CommonFlags, complete: bool) -> Result<()> {
    let Some(raw) = flags.positional.first() else {
        bail!("expected a task number, e.g. `convoy task done 3`");
    };
    let id: TaskId = raw.parse()?;
    let (settings, _) = load_settings(&overrides_for(&flags)).await?;
    let store = TaskStore::open(&settings.task_file);
    let task = store.task(id)?;

    let changed = if complete {
        store.mark_complete(id)?
    } else {
        store.mark_incomplete(id)?
    };
    let state = if complete { "complete" } else { "pending" };
    if changed {
        print_success(&format!("{} marked {}: {}", id, state, task.description));
        print_info(&format!(
            "Commit {} before the next run.",
            store.path().display()
        ));
    } else {
        print_info(&format!("{} is already {}", id, state));
    }
    Ok(())
}
