//! In-memory `WorkflowRepository` plus graph-building helpers for engine,
//! approval and cleanup tests.
//!
//! Every method takes the one state lock for its whole body, so each call is
//! atomic the way the SQLite transactions are.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use flowgate_types::approval::{ApprovalRequest, ApprovalStatus};
use flowgate_types::config::EngineSettings;
use flowgate_types::error::RepositoryError;
use flowgate_types::execution::{
    AuditEntry, ExecutionLog, ExecutionPatch, ExecutionStatus, NodeState, WorkflowExecution,
};
use flowgate_types::workflow::{Edge, Node, NodeKind, Workflow, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::queue::InMemoryJobQueue;
use crate::repository::workflow::{ApprovalResolution, Repair, WorkflowRepository};

use super::engine::WorkflowEngine;
use super::nodes::{BuiltinServices, builtin_registry};

#[derive(Default)]
struct State {
    workflows: HashMap<Uuid, Workflow>,
    executions: HashMap<Uuid, WorkflowExecution>,
    approvals: HashMap<Uuid, ApprovalRequest>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub(crate) struct MemoryRepository {
    state: Mutex<State>,
    /// Heartbeats accepted by `touch_execution`.
    pub(crate) touches: AtomicUsize,
}

impl MemoryRepository {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Query("state mutex poisoned".into()))
    }

    /// Test hook: rewrite an execution in place.
    pub(crate) fn update_execution(&self, id: Uuid, f: impl FnOnce(&mut WorkflowExecution)) {
        let mut state = self.state.lock().unwrap();
        if let Some(execution) = state.executions.get_mut(&id) {
            f(execution);
        }
    }

    /// Test hook: rewrite an approval in place.
    pub(crate) fn update_approval(&self, id: Uuid, f: impl FnOnce(&mut ApprovalRequest)) {
        let mut state = self.state.lock().unwrap();
        if let Some(approval) = state.approvals.get_mut(&id) {
            f(approval);
        }
    }
}

fn apply_patch(execution: &mut WorkflowExecution, patch: ExecutionPatch) {
    if let Some(v) = patch.started_at {
        execution.started_at = Some(v);
    }
    if let Some(v) = patch.completed_at {
        execution.completed_at = Some(v);
    }
    if let Some(v) = patch.output {
        execution.output = Some(v);
    }
    if let Some(v) = patch.error {
        execution.error = Some(v);
    }
    if let Some(v) = patch.duration_ms {
        execution.duration_ms = Some(v);
    }
    if let Some(v) = patch.job_id {
        execution.job_id = Some(v);
    }
}

fn force_error(state: &mut State, repair: &Repair) {
    if let Some(execution) = state.executions.get_mut(&repair.execution_id) {
        execution.status = ExecutionStatus::Error;
        execution.error = Some(repair.diagnostic.clone());
        execution.completed_at = Some(repair.now);
        execution
            .logs
            .push(ExecutionLog::error(None, repair.diagnostic.clone()));
    }
    state.audit.push(AuditEntry {
        execution_id: repair.execution_id,
        action: repair.action.to_string(),
        detail: repair.diagnostic.clone(),
        created_at: repair.now,
    });
}

fn has_pending_approval(state: &State, execution_id: Uuid) -> bool {
    state
        .approvals
        .values()
        .any(|a| a.execution_id == execution_id && a.status == ApprovalStatus::Pending)
}

impl WorkflowRepository for MemoryRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let metrics = state.workflows.get(&workflow.id).map(|w| w.metrics.clone());
        let mut stored = workflow.clone();
        if let Some(metrics) = metrics {
            stored.metrics = metrics;
        }
        state.workflows.insert(workflow.id, stored);
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.lock()?.workflows.get(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let mut all: Vec<_> = self.lock()?.workflows.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn record_execution_metrics(
        &self,
        workflow_id: &Uuid,
        success: bool,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let workflow = state
            .workflows
            .get_mut(workflow_id)
            .ok_or(RepositoryError::NotFound)?;
        let m = &mut workflow.metrics;
        m.avg_duration_ms =
            (m.avg_duration_ms * m.total_executions as f64 + duration_ms as f64) / (m.total_executions + 1) as f64;
        m.total_executions += 1;
        if success {
            m.successful_executions += 1;
        } else {
            m.failed_executions += 1;
        }
        m.last_executed_at = Some(finished_at);
        Ok(())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(execution.id.to_string()));
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.lock()?.executions.get(id).cloned())
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = self.lock()?;
        let mut rows: Vec<_> = state
            .executions
            .values()
            .filter(|e| e.workflow_id == *workflow_id)
            .cloned()
            .map(|mut e| {
                e.node_states.clear();
                e.logs.clear();
                e
            })
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn transition_execution(
        &self,
        id: &Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let Some(execution) = state.executions.get_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&execution.status) {
            return Ok(false);
        }
        execution.status = to;
        apply_patch(execution, patch);
        Ok(true)
    }

    async fn append_node_state(&self, execution_id: &Uuid, node_state: &NodeState) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let execution = state
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.node_states.push(node_state.clone());
        execution.last_progress_at = Some(Utc::now());
        Ok(())
    }

    async fn touch_execution(&self, id: &Uuid, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        match state.executions.get_mut(id) {
            Some(execution) if execution.status == ExecutionStatus::Running => {
                execution.last_progress_at = Some(at);
                self.touches.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_log(&self, execution_id: &Uuid, log: &ExecutionLog) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let execution = state
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.logs.push(log.clone());
        Ok(())
    }

    async fn cancel_execution(&self, id: &Uuid, now: DateTime<Utc>) -> Result<Option<ExecutionStatus>, RepositoryError> {
        let mut state = self.lock()?;
        let Some(execution) = state.executions.get_mut(id) else {
            return Ok(None);
        };
        if execution.status.is_terminal() {
            return Ok(None);
        }
        let previous = execution.status;
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(now);
        for approval in state.approvals.values_mut() {
            if approval.execution_id == *id && approval.status == ApprovalStatus::Pending {
                approval.status = ApprovalStatus::Rejected;
                approval.resolved_at = Some(now);
                approval.comment = Some("execution cancelled".into());
            }
        }
        Ok(Some(previous))
    }

    async fn suspend_execution(
        &self,
        execution_id: &Uuid,
        node_state: &NodeState,
        approval: &ApprovalRequest,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let Some(execution) = state.executions.get_mut(execution_id) else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::Running {
            return Ok(false);
        }
        execution.status = ExecutionStatus::Waiting;
        execution.node_states.push(node_state.clone());
        execution.last_progress_at = Some(Utc::now());
        state.approvals.insert(approval.id, approval.clone());
        Ok(true)
    }

    async fn get_approval(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        Ok(self.lock()?.approvals.get(id).cloned())
    }

    async fn list_approvals(&self, execution_id: &Uuid) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut rows: Vec<_> = self
            .lock()?
            .approvals
            .values()
            .filter(|a| a.execution_id == *execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn resolve_approval(&self, resolution: &ApprovalResolution) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let Some(approval) = state.approvals.get_mut(&resolution.approval_id) else {
            return Ok(false);
        };
        if approval.status != ApprovalStatus::Pending || approval.expires_at <= resolution.now {
            return Ok(false);
        }
        approval.status = resolution.decision.status();
        approval.decided_by = resolution.decision.decided_by.clone();
        approval.comment = resolution.decision.comment.clone();
        approval.resolved_at = Some(resolution.now);

        let Some(execution) = state.executions.get_mut(&resolution.execution_id) else {
            return Ok(true);
        };
        if execution.status == ExecutionStatus::Waiting {
            if resolution.decision.approved {
                execution.status = ExecutionStatus::Running;
                if let Some(node_state) = &resolution.node_state {
                    execution.node_states.push(node_state.clone());
                }
                execution.last_progress_at = Some(resolution.now);
            } else {
                execution.status = ExecutionStatus::Error;
                execution.error = resolution.error.clone();
                execution.completed_at = Some(resolution.now);
            }
        }
        Ok(true)
    }

    async fn list_zombie_candidates(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Running
                    && e.last_progress_at.or(e.started_at).is_some_and(|t| t < cutoff)
            })
            .map(|e| e.id)
            .take(limit as usize)
            .collect())
    }

    async fn reap_zombie(&self, repair: &Repair, cutoff: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let stale = state.executions.get(&repair.execution_id).is_some_and(|e| {
            e.status == ExecutionStatus::Running
                && e.last_progress_at.or(e.started_at).is_some_and(|t| t < cutoff)
        });
        if !stale {
            return Ok(false);
        }
        force_error(&mut state, repair);
        Ok(true)
    }

    async fn list_expired_approvals(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .approvals
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending && a.expires_at < now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn expire_approval(&self, approval_id: &Uuid, repair: &Repair) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let Some(approval) = state.approvals.get_mut(approval_id) else {
            return Ok(false);
        };
        if approval.status != ApprovalStatus::Pending {
            return Ok(false);
        }
        approval.status = ApprovalStatus::Expired;
        approval.resolved_at = Some(repair.now);
        let waiting = state
            .executions
            .get(&repair.execution_id)
            .is_some_and(|e| e.status == ExecutionStatus::Waiting);
        if waiting {
            force_error(&mut state, repair);
        }
        Ok(true)
    }

    async fn list_orphaned_executions(&self, limit: u32) -> Result<Vec<Uuid>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Waiting && !has_pending_approval(&state, e.id))
            .map(|e| e.id)
            .take(limit as usize)
            .collect())
    }

    async fn repair_orphan(&self, repair: &Repair) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let orphaned = state
            .executions
            .get(&repair.execution_id)
            .is_some_and(|e| e.status == ExecutionStatus::Waiting)
            && !has_pending_approval(&state, repair.execution_id);
        if !orphaned {
            return Ok(false);
        }
        force_error(&mut state, repair);
        Ok(true)
    }

    async fn list_audit_entries(&self, execution_id: &Uuid) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|a| a.execution_id == *execution_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub(crate) type TestEngine = WorkflowEngine<MemoryRepository, InMemoryJobQueue>;

pub(crate) fn engine_with(services: BuiltinServices, config: EngineSettings) -> (Arc<MemoryRepository>, TestEngine) {
    let repo = Arc::new(MemoryRepository::new());
    let engine = WorkflowEngine::new(
        repo.clone(),
        Arc::new(InMemoryJobQueue::new()),
        Arc::new(builtin_registry(services)),
        config,
    );
    (repo, engine)
}

pub(crate) fn engine() -> (Arc<MemoryRepository>, TestEngine) {
    engine_with(BuiltinServices::default(), EngineSettings::default())
}

pub(crate) fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
    let mut wf = Workflow::new("test");
    wf.status = WorkflowStatus::Active;
    wf.nodes = nodes;
    wf.edges = edges;
    wf
}

pub(crate) fn node(id: &str, kind: NodeKind, config: Value) -> Node {
    Node::new(id, kind, config)
}

pub(crate) fn edge(source: &str, target: &str) -> Edge {
    Edge::new(format!("{source}->{target}"), source, target)
}
