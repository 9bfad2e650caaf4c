//! Error taxonomy for the workflow engine.

use flowgate_types::error::{QueueError, RepositoryError};
use flowgate_types::execution::ExecutionStatus;
use flowgate_types::approval::ApprovalStatus;
use flowgate_types::workflow::WorkflowStatus;
use thiserror::Error;
use uuid::Uuid;

/// Bad graph shape or bad definition. Raised before anything is persisted
/// whenever possible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("ambiguous start node: {0}")]
    AmbiguousStart(String),

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("edge '{edge_id}' references unknown node '{node_id}'")]
    UnknownEdgeEndpoint { edge_id: String, node_id: String },

    #[error("cycle detected in workflow graph at node '{0}'")]
    CycleDetected(String),

    #[error("workflow is {status} and cannot be executed")]
    WorkflowNotRunnable { status: WorkflowStatus },

    #[error("parse error: {0}")]
    Parse(String),
}

/// Errors surfaced by the engine's inbound operations.
///
/// Node-level failures are not errors at this level: they end the run with
/// status `failed` and are reported through the execution record.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("approval {0} not found")]
    ApprovalNotFound(Uuid),

    #[error("approval {id} is {status}, not pending")]
    ApprovalNotPending { id: Uuid, status: ApprovalStatus },

    #[error("approval {approval_id} expired before a decision was made")]
    ApprovalExpired { approval_id: Uuid },

    #[error("approval {0} was resolved concurrently")]
    ApprovalConflict(Uuid),

    #[error("node '{node_id}' failed: {error}")]
    NodeExecution { node_id: String, error: String },

    #[error(
        "execution {execution_id} terminated: no progress for over {threshold_secs}s while running"
    )]
    ZombieTerminated {
        execution_id: Uuid,
        threshold_secs: u64,
    },

    #[error("orphaned execution {0}: waiting without a pending approval")]
    Orphaned(Uuid),

    #[error("execution {id} is {status} and cannot be resumed")]
    NotResumable { id: Uuid, status: ExecutionStatus },

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("execution timed out after {0}s")]
    Timeout(u64),

    #[error("no executor registered for node type '{0}'")]
    UnknownNodeType(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl EngineError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Repository(_) | Self::Queue(_))
    }
}
