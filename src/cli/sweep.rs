//! `pmr sweep`.

use std::path::Path;

use crate::config::Config;
use crate::runtime::ContainerRuntime;
use crate::session::{Session, SweepReport};

/// Kill every container recorded in the session ledger.
pub async fn run_sweep_command(
    runtime: &dyn ContainerRuntime,
    config: &Config,
    session_dir: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let session = Session::new(session_dir.unwrap_or(&config.session_dir));
    let report = session.sweep(runtime).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&session, &report);
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} container(s) could not be killed", report.failed.len());
    }
    Ok(())
}

fn print_report(session: &Session, report: &SweepReport) {
    if report.killed.is_empty() && report.missing.is_empty() && report.failed.is_empty() {
        println!("No containers recorded in {}", session.ledger().path().display());
        return;
    }

    println!("Killed {} container(s)", report.killed.len());
    if !report.missing.is_empty() {
        println!("{} container(s) were already gone", report.missing.len());
    }
    for (id, reason) in &report.failed {
        println!("Failed to kill {id}: {reason}");
    }
}
