//! CLI command definitions for the `flowgate` binary.

pub mod execution;
pub mod runtime;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Run and operate durable workflows.
#[derive(Parser)]
#[command(name = "flowgate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Only log errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// More log output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to `~/.flowgate/config.toml`).
    #[arg(long, global = true, env = "FLOWGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API together with the job workers and the cleanup worker.
    Serve {
        /// Port to listen on (overrides `server.port`).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides `server.host`).
        #[arg(long)]
        host: Option<String>,

        /// Serve HTTP only; leave queued jobs to separate `flowgate worker` processes.
        #[arg(long)]
        no_workers: bool,
    },

    /// Run job workers and the cleanup worker without the HTTP server.
    Worker {
        /// Concurrent workers (overrides `worker.concurrency`).
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Manage workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start an execution of a workflow.
    Run {
        workflow_id: Uuid,

        /// JSON input for the trigger node.
        #[arg(long)]
        input: Option<String>,

        /// Enqueue the execution for a worker instead of running it here.
        #[arg(long = "async")]
        async_mode: bool,

        /// Queue priority; higher is claimed first.
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// Inspect and control executions.
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Approve a pending approval request and resume its execution.
    Approve {
        approval_id: Uuid,

        /// Recorded as the decision maker.
        #[arg(long, default_value = "cli")]
        by: String,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Reject a pending approval request, failing its execution.
    Reject {
        approval_id: Uuid,

        #[arg(long, default_value = "cli")]
        by: String,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Repair zombie runs, expired approvals and orphaned executions.
    Cleanup {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
}
