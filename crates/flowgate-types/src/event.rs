//! Lifecycle events published on the engine's event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted while executions progress.
///
/// Serialized with a `type` tag so subscribers outside the process (SSE,
/// webhooks) get a stable wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        triggered_by: String,
    },
    NodeCompleted {
        execution_id: Uuid,
        node_id: String,
        duration_ms: u64,
    },
    NodeFailed {
        execution_id: Uuid,
        node_id: String,
        error: String,
    },
    ExecutionWaiting {
        execution_id: Uuid,
        approval_id: Uuid,
        node_id: String,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        workflow_id: Uuid,
        duration_ms: u64,
    },
    ExecutionFailed {
        execution_id: Uuid,
        workflow_id: Uuid,
        error: String,
    },
    ExecutionCancelled {
        execution_id: Uuid,
    },
}

impl WorkflowEvent {
    /// Dotted topic name used when forwarding to an external bus.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "workflow.started",
            Self::NodeCompleted { .. } => "workflow.node.completed",
            Self::NodeFailed { .. } => "workflow.node.failed",
            Self::ExecutionWaiting { .. } => "workflow.waiting",
            Self::ExecutionCompleted { .. } => "workflow.completed",
            Self::ExecutionFailed { .. } => "workflow.failed",
            Self::ExecutionCancelled { .. } => "workflow.cancelled",
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::ExecutionWaiting { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id } => *execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = WorkflowEvent::ExecutionCancelled {
            execution_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_cancelled");
        assert_eq!(event.topic(), "workflow.cancelled");
    }

    #[test]
    fn completion_topics() {
        let id = Uuid::now_v7();
        let done = WorkflowEvent::ExecutionCompleted {
            execution_id: id,
            workflow_id: id,
            duration_ms: 5,
        };
        let failed = WorkflowEvent::ExecutionFailed {
            execution_id: id,
            workflow_id: id,
            error: "boom".into(),
        };
        assert_eq!(done.topic(), "workflow.completed");
        assert_eq!(failed.topic(), "workflow.failed");
        assert_eq!(failed.execution_id(), id);
    }
}
