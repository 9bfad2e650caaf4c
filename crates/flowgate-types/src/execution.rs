//! Execution records: one run of a workflow, its append-only node states and
//! its log lines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution status state machine
// ---------------------------------------------------------------------------

/// Status of a workflow execution.
///
/// Transitions only move forward:
///
/// ```text
/// pending -> queued -> running -> {waiting, completed, failed, error, cancelled}
/// waiting -> {running, error, cancelled}
/// ```
///
/// `pending` and `queued` may also be cancelled directly, and `pending` may
/// start running without passing through the queue (synchronous execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Error,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 8] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Waiting,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Error,
    ];

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Error
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Queued | Running | Cancelled | Error)
                | (Queued, Running | Cancelled | Error)
                | (Running, Waiting | Completed | Failed | Error | Cancelled)
                | (Waiting, Running | Error | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("invalid execution status: {s}"))
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// One run instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    /// Who or what started the run (e.g. "manual", "webhook", "api:alice").
    pub triggered_by: String,
    #[serde(default)]
    pub priority: i32,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Append-only; the last entry for a node id is authoritative.
    #[serde(default)]
    pub node_states: Vec<NodeState>,
    #[serde(default)]
    pub logs: Vec<ExecutionLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Refreshed whenever the run records progress. Used for zombie detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl WorkflowExecution {
    /// A fresh `pending` execution for the given workflow.
    pub fn new(
        workflow_id: Uuid,
        workflow_version: u32,
        triggered_by: impl Into<String>,
        input: Value,
        priority: i32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version,
            status: ExecutionStatus::Pending,
            triggered_by: triggered_by.into(),
            priority,
            input,
            output: None,
            error: None,
            node_states: Vec::new(),
            logs: Vec::new(),
            job_id: None,
            created_at: Utc::now(),
            started_at: None,
            last_progress_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// The authoritative (last recorded) state for a node.
    pub fn latest_state(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.iter().rev().find(|s| s.node_id == node_id)
    }
}

/// Optional fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub job_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Node states
// ---------------------------------------------------------------------------

/// Outcome recorded for a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    /// Suspended at an approval gate.
    Waiting,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "waiting" => Ok(Self::Waiting),
            other => Err(format!("invalid node status: {other}")),
        }
    }
}

/// Append-only record of what happened at one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl NodeState {
    pub fn completed(node_id: impl Into<String>, output: Value) -> Self {
        Self::new(node_id, NodeStatus::Completed, Some(output), None)
    }

    pub fn failed(node_id: impl Into<String>, error: impl Into<String>, output: Option<Value>) -> Self {
        Self::new(node_id, NodeStatus::Failed, output, Some(error.into()))
    }

    pub fn waiting(node_id: impl Into<String>) -> Self {
        Self::new(node_id, NodeStatus::Waiting, None, None)
    }

    fn new(
        node_id: impl Into<String>,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            status,
            output,
            error,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Stamp timing information.
    pub fn timed(mut self, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        let elapsed = (completed_at - started_at).num_milliseconds().max(0) as u64;
        self.started_at = Some(started_at);
        self.completed_at = Some(completed_at);
        self.duration_ms = Some(elapsed);
        self
    }
}

// ---------------------------------------------------------------------------
// Logs and audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("invalid log level: {other}")),
        }
    }
}

/// A log line attached to an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

impl ExecutionLog {
    pub fn new(level: LogLevel, node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            node_id: node_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn info(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, node_id, message)
    }

    pub fn error(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, node_id, message)
    }
}

/// Record of a forced transition performed by the cleanup worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub execution_id: Uuid,
    /// Machine-readable action, e.g. `zombie_reaped`.
    pub action: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in ExecutionStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ExecutionStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn waiting_can_resume_or_error() {
        assert!(ExecutionStatus::Waiting.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Waiting.can_transition_to(ExecutionStatus::Error));
        assert!(!ExecutionStatus::Waiting.can_transition_to(ExecutionStatus::Completed));
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Queued));
    }

    #[test]
    fn status_strings_are_stable() {
        let json = serde_json::to_value(ExecutionStatus::Cancelled).unwrap();
        assert_eq!(json, json!("cancelled"));
        for st in ExecutionStatus::ALL {
            assert_eq!(st.as_str().parse::<ExecutionStatus>().unwrap(), st);
        }
    }

    #[test]
    fn latest_state_prefers_last_entry() {
        let mut exec = WorkflowExecution::new(Uuid::now_v7(), 1, "test", json!({}), 0);
        exec.node_states.push(NodeState::waiting("approve"));
        exec.node_states
            .push(NodeState::completed("approve", json!({"approved": true})));
        assert_eq!(
            exec.latest_state("approve").unwrap().status,
            NodeStatus::Completed
        );
        assert!(exec.latest_state("missing").is_none());
    }

    #[test]
    fn timed_state_computes_duration() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(250);
        let st = NodeState::completed("n", json!(1)).timed(start, end);
        assert_eq!(st.duration_ms, Some(250));
    }
}
