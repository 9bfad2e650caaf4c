//! `flowgate run`, `flowgate execution ...` and the approval decisions.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowgate_core::repository::workflow::WorkflowRepository;
use flowgate_core::workflow::engine::{ExecuteOptions, ExecuteResponse};
use flowgate_types::approval::{ApprovalDecision, ApprovalStatus};
use flowgate_types::execution::{ExecutionStatus, LogLevel, NodeStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// Show an execution with its node states, logs and approvals.
    Show { id: Uuid },

    /// List executions of a workflow, newest first.
    #[command(alias = "ls")]
    List {
        workflow_id: Uuid,

        #[arg(long, default_value_t = 20)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Cancel a queued, running or waiting execution.
    Cancel { id: Uuid },
}

pub async fn handle_execution_command(cmd: ExecutionCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ExecutionCommand::Show { id } => show(id, state, json).await,
        ExecutionCommand::List {
            workflow_id,
            limit,
            offset,
        } => list(workflow_id, limit, offset, state, json).await,
        ExecutionCommand::Cancel { id } => cancel(id, state, json).await,
    }
}

pub async fn run(
    workflow_id: Uuid,
    input: Option<&str>,
    options: ExecuteOptions,
    state: &AppState,
    json: bool,
) -> Result<ExecuteResponse> {
    let input = parse_input(input)?;
    let response = state.engine.execute(workflow_id, "cli", input, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(response);
    }

    println!();
    println!(
        "  {} Execution {} is {}",
        style("*").green().bold(),
        response.execution_id,
        styled_status(response.status)
    );
    match response.status {
        ExecutionStatus::Queued => println!(
            "  A worker will pick it up. Follow it with: {}",
            style(format!("flowgate execution show {}", response.execution_id)).dim()
        ),
        ExecutionStatus::Waiting => {
            for approval in state.engine.repository().list_approvals(&response.execution_id).await? {
                if approval.status == ApprovalStatus::Pending {
                    println!("  Waiting on '{}': {}", approval.title, style(format!("flowgate approve {}", approval.id)).dim());
                }
            }
        }
        _ => {}
    }
    println!();
    Ok(response)
}

/// `--input` as JSON; a missing flag is an empty object.
fn parse_input(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}

async fn show(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let execution = state.engine.get_execution(id).await?;
    let approvals = state.engine.repository().list_approvals(&id).await?;

    if json {
        let mut out = serde_json::to_value(&execution)?;
        out["approvals"] = serde_json::to_value(&approvals)?;
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Execution {} is {}", style(execution.id).cyan(), styled_status(execution.status));
    println!("  Workflow: {} (v{})", execution.workflow_id, execution.workflow_version);
    println!("  Triggered by: {}", execution.triggered_by);
    if let Some(ms) = execution.duration_ms {
        println!("  Duration: {ms} ms");
    }
    if let Some(error) = &execution.error {
        println!("  Error: {}", style(error).red());
    }
    if let Some(output) = &execution.output {
        println!("  Output: {output}");
    }
    println!();

    if !execution.node_states.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Node").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Duration"),
                Cell::new("Error"),
            ]);
        for state in &execution.node_states {
            let status = Cell::new(state.status.as_str()).fg(match state.status {
                NodeStatus::Completed => Color::Green,
                NodeStatus::Failed => Color::Red,
                NodeStatus::Waiting => Color::Yellow,
            });
            table.add_row(vec![
                Cell::new(&state.node_id),
                status,
                Cell::new(state.duration_ms.map(|ms| format!("{ms} ms")).unwrap_or_default()),
                Cell::new(state.error.as_deref().unwrap_or_default()),
            ]);
        }
        println!("{table}");
    }

    if !execution.logs.is_empty() {
        println!();
        for log in &execution.logs {
            let level = match log.level {
                LogLevel::Error => style(log.level.as_str()).red(),
                LogLevel::Warn => style(log.level.as_str()).yellow(),
                _ => style(log.level.as_str()).dim(),
            };
            println!(
                "  {} {:5} {}{}",
                log.timestamp.format("%H:%M:%S%.3f"),
                level,
                log.node_id.as_deref().map(|n| format!("[{n}] ")).unwrap_or_default(),
                log.message
            );
        }
    }

    for approval in &approvals {
        println!();
        println!(
            "  Approval {} '{}' is {}",
            approval.id,
            approval.title,
            style(approval.status).bold()
        );
        if approval.status == ApprovalStatus::Pending {
            println!("  Expires: {}", approval.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(by) = &approval.decided_by {
            println!("  Decided by: {by}");
        }
    }
    println!();
    Ok(())
}

async fn list(workflow_id: Uuid, limit: u32, offset: u32, state: &AppState, json: bool) -> Result<()> {
    let executions = state.engine.list_executions(workflow_id, limit, offset).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }
    if executions.is_empty() {
        println!();
        println!("  No executions for workflow {workflow_id}.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Triggered by"),
            Cell::new("Created"),
            Cell::new("Duration"),
        ]);
    for e in &executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(e.status).fg(status_color(e.status)),
            Cell::new(&e.triggered_by),
            Cell::new(e.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(e.duration_ms.map(|ms| format!("{ms} ms")).unwrap_or_default()),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn cancel(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let status = state.engine.cancel_execution(id).await?;
    if json {
        println!("{}", serde_json::json!({"execution_id": id, "status": status}));
    } else if status == ExecutionStatus::Cancelled {
        println!("  {} Cancelled execution {id}", style("*").green().bold());
    } else {
        println!("  Execution {id} already finished as {}", styled_status(status));
    }
    Ok(())
}

/// `flowgate approve` / `flowgate reject`.
pub async fn decide(approval_id: Uuid, decision: ApprovalDecision, state: &AppState, json: bool) -> Result<()> {
    let approved = decision.approved;
    let response = state
        .engine
        .resume_approval(approval_id, decision)
        .await
        .with_context(|| format!("could not resolve approval {approval_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        let verb = if approved { "Approved" } else { "Rejected" };
        println!(
            "  {} {verb}. Execution {} is {}",
            style("*").green().bold(),
            response.execution_id,
            styled_status(response.status)
        );
    }
    Ok(())
}

fn status_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed | ExecutionStatus::Error => Color::Red,
        ExecutionStatus::Waiting => Color::Yellow,
        ExecutionStatus::Cancelled => Color::DarkGrey,
        _ => Color::Blue,
    }
}

fn styled_status(status: ExecutionStatus) -> console::StyledObject<ExecutionStatus> {
    match status {
        ExecutionStatus::Completed => style(status).green(),
        ExecutionStatus::Failed | ExecutionStatus::Error => style(status).red(),
        ExecutionStatus::Waiting => style(status).yellow(),
        _ => style(status).cyan(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use flowgate_types::workflow::{Edge, Node, NodeKind, Workflow};
    use serde_json::json;

    async fn gated_workflow(state: &AppState) -> Uuid {
        let mut wf = Workflow::new("gated");
        wf.nodes = vec![
            Node::new("start", NodeKind::Trigger, Value::Null),
            Node::new("gate", NodeKind::HumanApproval, json!({"title": "ship?"})),
            Node::new("done", NodeKind::End, Value::Null),
        ];
        wf.edges = vec![Edge::new("e1", "start", "gate"), Edge::new("e2", "gate", "done")];
        state.engine.create_workflow(wf).await.unwrap().id
    }

    #[test]
    fn input_defaults_to_empty_object() {
        assert_eq!(parse_input(None).unwrap(), json!({}));
        assert_eq!(parse_input(Some(r#"{"n": 2}"#)).unwrap(), json!({"n": 2}));
        assert!(parse_input(Some("{oops")).is_err());
    }

    #[tokio::test]
    async fn run_then_reject_fails_the_execution() {
        let (_dir, state) = test_state().await;
        let workflow_id = gated_workflow(&state).await;

        let response = run(workflow_id, None, ExecuteOptions::default(), &state, true).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Waiting);

        let approval = state
            .engine
            .repository()
            .list_approvals(&response.execution_id)
            .await
            .unwrap()
            .remove(0);
        decide(approval.id, ApprovalDecision::reject("cli").with_comment("no"), &state, true)
            .await
            .unwrap();

        let execution = state.engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert!(decide(approval.id, ApprovalDecision::approve("cli"), &state, true).await.is_err());
    }

    #[tokio::test]
    async fn cancel_reports_terminal_status() {
        let (_dir, state) = test_state().await;
        let workflow_id = gated_workflow(&state).await;
        let response = run(workflow_id, None, ExecuteOptions::default(), &state, true).await.unwrap();

        cancel(response.execution_id, &state, true).await.unwrap();
        let execution = state.engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        // Second cancel is a no-op.
        cancel(response.execution_id, &state, true).await.unwrap();
    }
}
