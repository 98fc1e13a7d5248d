use crate::output::{ago, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use rollout_core::engine::{CoordinatorState, DeviceState, RunDb, RunRecord};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum RunsSubcommand {
    /// List recorded runs, newest first
    List,
    /// Show one run with its device processes
    Show { id: String },
}

pub fn run(
    config_path: &Path,
    db: Option<PathBuf>,
    subcmd: RunsSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let path = db.unwrap_or(config.engine.database);
    let db = RunDb::open(&path).with_context(|| {
        format!(
            "failed to open run database {} (while the server is running, use GET /api/runs)",
            path.display()
        )
    })?;

    match subcmd {
        RunsSubcommand::List => list(&db, json),
        RunsSubcommand::Show { id } => show(&db, &id, json),
    }
}

fn list(db: &RunDb, json: bool) -> anyhow::Result<()> {
    let runs = db.list_all()?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = runs
        .iter()
        .map(|r| {
            vec![
                r.id.clone(),
                r.request.kind().to_string(),
                r.state.as_str().to_string(),
                r.diff.len().max(r.children.len()).to_string(),
                ago(r.updated_at),
            ]
        })
        .collect();
    print_table(&["ID", "KIND", "STATE", "DEVICES", "UPDATED"], &rows);
    Ok(())
}

fn show(db: &RunDb, id: &str, json: bool) -> anyhow::Result<()> {
    let record = db
        .get(id)?
        .ok_or_else(|| rollout_core::RolloutError::RunNotFound(id.to_string()))?;
    if json {
        return print_json(&record);
    }
    print_record(&record)
}

fn print_record(record: &RunRecord) -> anyhow::Result<()> {
    println!("Run:      {}", record.id);
    println!("Kind:     {}", record.request.kind());
    println!("State:    {}", record.state.as_str());
    println!("Created:  {}", record.created_at.to_rfc3339());
    println!("Updated:  {} ({})", record.updated_at.to_rfc3339(), ago(record.updated_at));
    if let Some(since) = record.awaiting_since {
        println!("Waiting since: {}", since.to_rfc3339());
    }

    if !record.diff.is_empty() {
        println!();
        let rows: Vec<Vec<String>> = record
            .diff
            .iter()
            .map(|e| {
                let ready = if record.readiness.contains(&e.key()) {
                    "yes"
                } else {
                    "no"
                };
                vec![
                    e.display_label.clone(),
                    e.key().to_string(),
                    ready.to_string(),
                ]
            })
            .collect();
        print_table(&["DEVICE", "ARTIFACT", "SIGNALLED"], &rows);
    }

    if !record.children.is_empty() {
        println!();
        let rows: Vec<Vec<String>> = record
            .children
            .values()
            .map(|c| {
                let detail = match &c.state {
                    DeviceState::Failed { reason } => reason.clone(),
                    DeviceState::Done { diff } => diff
                        .device(&c.device)
                        .map(|changes| format!("{} path(s)", changes.len()))
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                vec![c.id.clone(), c.state.as_str().to_string(), detail]
            })
            .collect();
        print_table(&["PROCESS", "STATE", "DETAIL"], &rows);
    }

    match &record.state {
        CoordinatorState::Failed { reason } => {
            println!();
            println!("Failure: {reason}");
        }
        CoordinatorState::Gathered { result } => {
            println!();
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        _ => {}
    }
    Ok(())
}
