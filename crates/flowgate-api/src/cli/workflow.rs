//! `flowgate workflow` subcommands: import, list and show definitions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowgate_core::repository::workflow::WorkflowRepository;
use flowgate_core::workflow::definition::{discover_workflows, load_workflow_file, serialize_workflow_yaml};
use flowgate_types::workflow::Workflow;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate and store a definition file, or every definition in a directory.
    Import {
        /// A `.yaml`, `.yml` or `.json` file, or a directory of them.
        path: PathBuf,
    },

    /// List stored workflows with their run metrics.
    #[command(alias = "ls")]
    List,

    /// Show one workflow.
    Show {
        id: Uuid,

        /// Print the definition as YAML.
        #[arg(long)]
        yaml: bool,
    },
}

pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Import { path } => import(&path, state, json).await,
        WorkflowCommand::List => list(state, json).await,
        WorkflowCommand::Show { id, yaml } => show(id, yaml, state, json).await,
    }
}

async fn import(path: &Path, state: &AppState, json: bool) -> Result<()> {
    let definitions = if path.is_dir() {
        discover_workflows(path).with_context(|| format!("failed to scan {}", path.display()))?
    } else {
        let workflow = load_workflow_file(path).with_context(|| format!("failed to load {}", path.display()))?;
        vec![(path.to_path_buf(), workflow)]
    };

    let mut imported = Vec::with_capacity(definitions.len());
    for (file, workflow) in definitions {
        let workflow = state
            .engine
            .create_workflow(workflow)
            .await
            .with_context(|| format!("failed to store {}", file.display()))?;
        imported.push((file, workflow));
    }

    if json {
        let out: Vec<_> = imported
            .iter()
            .map(|(file, w)| {
                serde_json::json!({
                    "file": file.display().to_string(),
                    "id": w.id,
                    "name": w.name,
                    "version": w.version,
                    "nodes": w.nodes.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if imported.is_empty() {
        println!("  No workflow definitions found in {}.", path.display());
    }
    for (file, w) in &imported {
        println!(
            "  {} Imported '{}' ({} nodes) from {}",
            style("*").green().bold(),
            style(&w.name).cyan(),
            w.nodes.len(),
            style(file.display()).dim()
        );
        println!("    ID: {}", w.id);
    }
    println!();
    Ok(())
}

async fn list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.engine.repository().list_workflows().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!("  Import one with: {}", style("flowgate workflow import <file.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Nodes"),
            Cell::new("Runs"),
            Cell::new("Success"),
            Cell::new("Avg ms"),
        ]);
    for w in &workflows {
        table.add_row(vec![
            Cell::new(w.id),
            Cell::new(&w.name),
            Cell::new(w.version),
            Cell::new(w.status),
            Cell::new(w.nodes.len()),
            Cell::new(w.metrics.total_executions),
            Cell::new(success_rate(w)),
            Cell::new(format!("{:.0}", w.metrics.avg_duration_ms)),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn show(id: Uuid, yaml: bool, state: &AppState, json: bool) -> Result<()> {
    let workflow = state
        .engine
        .repository()
        .get_workflow(&id)
        .await?
        .with_context(|| format!("workflow {id} not found"))?;

    if yaml {
        print!("{}", serialize_workflow_yaml(&workflow)?);
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!();
    println!("  {} (v{}, {})", style(&workflow.name).cyan().bold(), workflow.version, workflow.status);
    println!("  ID: {}", workflow.id);
    println!(
        "  Runs: {} total, {} ok, {} failed ({})",
        workflow.metrics.total_executions,
        workflow.metrics.successful_executions,
        workflow.metrics.failed_executions,
        success_rate(&workflow)
    );
    if let Some(last) = workflow.metrics.last_executed_at {
        println!("  Last run: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Node").fg(Color::Cyan), Cell::new("Type"), Cell::new("Next")]);
    for node in &workflow.nodes {
        let next: Vec<&str> = workflow
            .edges
            .iter()
            .filter(|e| e.source == node.id)
            .map(|e| e.target.as_str())
            .collect();
        table.add_row(vec![
            Cell::new(node.label()),
            Cell::new(&node.node_type),
            Cell::new(next.join(", ")),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn success_rate(w: &Workflow) -> String {
    if w.metrics.total_executions == 0 {
        return "-".to_string();
    }
    let rate = w.metrics.successful_executions as f64 / w.metrics.total_executions as f64;
    format!("{:.0}%", rate * 100.0)
}
