//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions, node
//! states, approvals and the cleanup worker's repair queries. The
//! infrastructure layer (flowgate-infra) implements this trait with SQLite
//! persistence.
//!
//! Every status change goes through a conditional update on the expected
//! `from` state(s) and reports whether it took effect. Callers treat `false`
//! as "someone else got there first" -- never as an error.

use std::future::Future;

use chrono::{DateTime, Utc};
use flowgate_types::approval::{ApprovalDecision, ApprovalRequest};
use flowgate_types::error::RepositoryError;
use flowgate_types::execution::{
    AuditEntry, ExecutionLog, ExecutionPatch, ExecutionStatus, NodeState, WorkflowExecution,
};
use flowgate_types::workflow::Workflow;
use uuid::Uuid;

/// Everything the repository needs to resolve an approval atomically.
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub approval_id: Uuid,
    pub execution_id: Uuid,
    pub decision: ApprovalDecision,
    /// Appended to the execution when the decision is an approval.
    pub node_state: Option<NodeState>,
    /// Written to `executions.error` when the decision is a rejection.
    pub error: Option<String>,
    pub now: DateTime<Utc>,
}

/// A forced terminal transition performed by the cleanup worker.
#[derive(Debug, Clone)]
pub struct Repair {
    pub execution_id: Uuid,
    /// Audit action name, e.g. `zombie_reaped`.
    pub action: &'static str,
    /// Human-readable diagnostic stored as the execution's error.
    pub diagnostic: String,
    pub now: DateTime<Utc>,
}

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Definitions:** workflow graphs and their rolling metrics.
/// - **Executions:** run records, append-only node states and log lines.
/// - **Approvals:** suspension records and their atomic resolution.
/// - **Repairs:** candidate queries and conditional repairs for the cleanup worker.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID). Metrics are
    /// never overwritten by a save.
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    fn list_workflows(&self) -> impl Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Fold one finished execution into the workflow's rolling metrics.
    ///
    /// Must be a single atomic increment / weighted-average at the storage
    /// layer, never a read-modify-write.
    fn record_execution_metrics(
        &self,
        workflow_id: &Uuid,
        success: bool,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Full record including node states and logs.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Newest first. Node states and logs are not loaded.
    fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Move an execution to `to` if its current status is one of `from`.
    ///
    /// Fields set in `patch` are written in the same statement. Returns
    /// whether a row changed.
    fn transition_execution(
        &self,
        id: &Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Append a node state and bump `last_progress_at`.
    fn append_node_state(
        &self,
        execution_id: &Uuid,
        state: &NodeState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Refresh `last_progress_at` of a `running` execution. Returns whether
    /// a row changed.
    fn touch_execution(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    fn append_log(
        &self,
        execution_id: &Uuid,
        log: &ExecutionLog,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Cancel a non-terminal execution. Any pending approval is rejected in
    /// the same transaction. Returns the status the execution had before, or
    /// `None` if it was already terminal (or missing).
    fn cancel_execution(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<ExecutionStatus>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// In one transaction: append the `waiting` node state, insert the
    /// pending approval and move the execution `running -> waiting`.
    ///
    /// Returns `false` (and writes nothing) if the execution was no longer
    /// running.
    fn suspend_execution(
        &self,
        execution_id: &Uuid,
        state: &NodeState,
        approval: &ApprovalRequest,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_approval(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    fn list_approvals(
        &self,
        execution_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;

    /// In one transaction, conditional on the approval still being pending
    /// and unexpired at `now`: set it approved/rejected and move the
    /// execution `waiting -> running` (approved, appending the node state)
    /// or `waiting -> error` (rejected). Exactly one concurrent caller wins.
    fn resolve_approval(
        &self,
        resolution: &ApprovalResolution,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Repairs (cleanup worker)
    // -----------------------------------------------------------------------

    /// Running executions whose last progress (or start) is before `cutoff`.
    fn list_zombie_candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Force a still-stale running execution to `error`, logging and
    /// auditing only if this call performed the transition.
    fn reap_zombie(
        &self,
        repair: &Repair,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Pending approvals whose deadline is before `now`.
    fn list_expired_approvals(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;

    /// Mark the approval expired and cascade its execution `waiting -> error`.
    /// Returns `false` if the approval was no longer pending.
    fn expire_approval(
        &self,
        approval_id: &Uuid,
        repair: &Repair,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Waiting executions with no pending approval.
    fn list_orphaned_executions(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Force a still-orphaned waiting execution to `error`.
    fn repair_orphan(
        &self,
        repair: &Repair,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    fn list_audit_entries(
        &self,
        execution_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<AuditEntry>, RepositoryError>> + Send;
}
