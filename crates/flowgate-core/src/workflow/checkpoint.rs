//! Durable node checkpoints for workflow executions.
//!
//! Wraps `WorkflowRepository` with the node-level writes the engine performs
//! while traversing: completed and failed node states, and the suspension
//! transaction at an approval gate. `replay_memo` rebuilds the replay table
//! a resumed run uses to skip nodes that already completed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flowgate_types::approval::{ApprovalRequest, ApprovalStatus};
use flowgate_types::error::RepositoryError;
use flowgate_types::execution::{ExecutionLog, LogLevel, NodeState, NodeStatus, WorkflowExecution};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::registry::SuspendRequest;

/// Upper bound on an approval deadline (one year).
const MAX_APPROVAL_TTL_SECS: u64 = 365 * 24 * 3600;

/// Manages durable node checkpoints for execution runs.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, the in-memory test store). Every state is persisted before the
/// engine moves past the node.
pub struct Checkpointer<R: WorkflowRepository> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository> Checkpointer<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub async fn record_completed(
        &self,
        execution_id: Uuid,
        node_id: &str,
        output: Value,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<NodeState, RepositoryError> {
        let state = NodeState::completed(node_id, output).timed(started_at, finished_at);
        self.repo.append_node_state(&execution_id, &state).await?;
        tracing::debug!(execution_id = %execution_id, node_id, "checkpointed node complete");
        Ok(state)
    }

    pub async fn record_failed(
        &self,
        execution_id: Uuid,
        node_id: &str,
        error: &str,
        output: Option<Value>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<NodeState, RepositoryError> {
        let state = NodeState::failed(node_id, error, output).timed(started_at, finished_at);
        self.repo.append_node_state(&execution_id, &state).await?;
        self.repo
            .append_log(&execution_id, &ExecutionLog::error(Some(node_id), error))
            .await?;
        tracing::debug!(execution_id = %execution_id, node_id, error, "checkpointed node failed");
        Ok(state)
    }

    /// Attach node log lines to the execution.
    pub async fn record_logs(
        &self,
        execution_id: Uuid,
        node_id: &str,
        level: LogLevel,
        lines: &[String],
    ) -> Result<(), RepositoryError> {
        for line in lines {
            self.repo
                .append_log(&execution_id, &ExecutionLog::new(level, Some(node_id), line.clone()))
                .await?;
        }
        Ok(())
    }

    /// Park the execution at an approval gate.
    ///
    /// Returns the created approval, or `None` if the execution had already
    /// left `running` (for example, it was cancelled mid-wave).
    pub async fn suspend(
        &self,
        execution_id: Uuid,
        node_id: &str,
        request: &SuspendRequest,
        default_ttl_secs: u64,
        started_at: DateTime<Utc>,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let now = Utc::now();
        let ttl = request.timeout_secs.unwrap_or(default_ttl_secs).min(MAX_APPROVAL_TTL_SECS);
        let approval = ApprovalRequest {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node_id.to_string(),
            title: request.title.clone(),
            description: request.description.clone(),
            status: ApprovalStatus::Pending,
            decided_by: None,
            comment: None,
            expires_at: now + Duration::seconds(ttl as i64),
            created_at: now,
            resolved_at: None,
        };
        let state = NodeState::waiting(node_id).timed(started_at, now);

        if !self.repo.suspend_execution(&execution_id, &state, &approval).await? {
            return Ok(None);
        }
        tracing::debug!(
            execution_id = %execution_id,
            node_id,
            approval_id = %approval.id,
            expires_at = %approval.expires_at,
            "checkpointed suspension"
        );
        Ok(Some(approval))
    }
}

/// Latest completed state per node, used to replay a resumed run.
///
/// A later non-completed state for the same node (a retry that failed)
/// removes the entry.
pub fn replay_memo(execution: &WorkflowExecution) -> HashMap<String, NodeState> {
    let mut memo = HashMap::new();
    for state in &execution.node_states {
        if state.status == NodeStatus::Completed {
            memo.insert(state.node_id.clone(), state.clone());
        } else {
            memo.remove(&state.node_id);
        }
    }
    memo
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memo_keeps_latest_completed_state() {
        let mut execution = WorkflowExecution::new(Uuid::now_v7(), 1, "test", json!({}), 0);
        execution.node_states = vec![
            NodeState::completed("trigger", json!({"a": 1})),
            NodeState::waiting("gate"),
            NodeState::completed("gate", json!({"approved": true})),
            NodeState::failed("http", "boom", None),
        ];
        let memo = replay_memo(&execution);
        assert_eq!(memo.len(), 2);
        assert_eq!(memo["gate"].output, Some(json!({"approved": true})));
        assert!(!memo.contains_key("http"));
    }
}
