//! Flowgate CLI and REST API entry point.
//!
//! Binary name: `flowgate`
//!
//! Loads configuration, initializes tracing and the database, then dispatches
//! to a one-shot command or one of the long-running modes.

mod cli;
mod http;
mod state;

use clap::Parser;
use flowgate_core::workflow::engine::ExecuteOptions;
use flowgate_infra::config::{default_config_path, load_settings};
use flowgate_types::approval::ApprovalDecision;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut settings = load_settings(&config_path).await;
    if cli.quiet {
        settings.logging.filter = "error".to_string();
    }
    if let Err(e) = flowgate_observe::init_tracing(&settings.logging, cli.verbose) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli, settings).await;
    flowgate_observe::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, settings: flowgate_types::config::Settings) -> anyhow::Result<()> {
    let state = AppState::init(settings).await?;
    let json = cli.json;

    match cli.command {
        Commands::Serve { port, host, no_workers } => {
            cli::runtime::serve(state, host, port, !no_workers).await?;
        }
        Commands::Worker { concurrency } => {
            cli::runtime::worker(state, concurrency).await?;
        }
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, json).await?;
        }
        Commands::Run {
            workflow_id,
            input,
            async_mode,
            priority,
        } => {
            let options = ExecuteOptions { async_mode, priority };
            cli::execution::run(workflow_id, input.as_deref(), options, &state, json).await?;
        }
        Commands::Execution { action } => {
            cli::execution::handle_execution_command(action, &state, json).await?;
        }
        Commands::Approve {
            approval_id,
            by,
            comment,
        } => {
            let mut decision = ApprovalDecision::approve(by);
            decision.comment = comment;
            cli::execution::decide(approval_id, decision, &state, json).await?;
        }
        Commands::Reject {
            approval_id,
            by,
            comment,
        } => {
            let mut decision = ApprovalDecision::reject(by);
            decision.comment = comment;
            cli::execution::decide(approval_id, decision, &state, json).await?;
        }
        Commands::Cleanup { once } => {
            cli::runtime::cleanup(state, once, json).await?;
        }
    }

    Ok(())
}
