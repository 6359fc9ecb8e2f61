use anyhow::Result;

use super::{CommonFlags, load_settings, overrides_for};
use crate::core::orchestrator::Orchestrator;
use crate::core::terminal::{print_info, print_success, print_warn};

pub async fn cleanup_command(flags: CommonFlags) -> Result<()> {
    let (settings, _) = load_settings(&overrides_for(&flags)).await?;
    let report = Orchestrator::new(settings).cleanup(flags.force).await?;

    if flags.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for path in &report.removed {
        print_success(&format!("Removed {}", path.display()));
    }
    for path in &report.skipped_active {
        print_info(&format!("Skipped {} (belongs to the running run)", path.display()));
    }
    for path in &report.kept_with_residue {
        print_warn(&format!("Kept {} (uncommitted changes)", path.display()));
    }
    if !report.kept_with_residue.is_empty() {
        print_info("Re-run with --force to discard them.");
    }
    if report.removed.is_empty()
        && report.skipped_active.is_empty()
        && report.kept_with_residue.is_empty()
    {
        print_info("No workspaces to clean up.");
    }
    Ok(())
}
