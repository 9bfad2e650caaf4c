//! Workflow engine: drives executions through their state machine.
//!
//! A run traverses the compiled graph in waves. Every node whose governing
//! upstream edges have all resolved (and at least one fired) joins the next
//! wave; a node whose inputs all resolved without firing is dead, and its
//! deadness propagates downstream. Nodes within a wave run concurrently and
//! their results are applied in definition order, so the recorded node
//! states are deterministic for a deterministic graph.
//!
//! Suspension holds nothing in memory. A resumed run replays the traversal
//! from the start node, reusing the outputs of completed node states instead
//! of executing those nodes again, which rebuilds the context and the ready
//! set exactly.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowgate_types::approval::{ApprovalDecision, ApprovalStatus};
use flowgate_types::config::EngineSettings;
use flowgate_types::event::WorkflowEvent;
use flowgate_types::execution::{
    ExecutionLog, ExecutionPatch, ExecutionStatus, LogLevel, NodeState, WorkflowExecution,
};
use flowgate_types::job::{Job, JobKind, NewJob};
use flowgate_types::workflow::{Edge, NodeKind, Workflow};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::queue::JobQueue;
use crate::repository::workflow::{ApprovalResolution, WorkflowRepository};

use super::budget::{AllowAllBudget, BudgetGuard};
use super::checkpoint::{Checkpointer, replay_memo};
use super::condition::{evaluate, is_truthy};
use super::context::ExecutionContext;
use super::error::{EngineError, ValidationError};
use super::graph::WorkflowGraph;
use super::registry::{NodeExecutorRegistry, NodeResult};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Enqueue a start job instead of running inline.
    #[serde(default, rename = "async")]
    pub async_mode: bool,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

/// How a traversal ended, before the terminal transition is persisted.
#[derive(Debug)]
enum Outcome {
    Completed(Value),
    Failed(String),
    Suspended,
    Cancelled,
}

/// Per-run traversal bookkeeping.
struct Frontier {
    /// Unresolved reachable incoming edges per node.
    pending_in: Vec<usize>,
    /// Sources whose edges into each node fired.
    fired_from: Vec<Vec<usize>>,
    ready: Vec<usize>,
}

impl Frontier {
    fn new(graph: &WorkflowGraph) -> Self {
        Self {
            pending_in: (0..graph.len()).map(|i| graph.incoming_count(i)).collect(),
            fired_from: vec![Vec::new(); graph.len()],
            ready: vec![graph.start()],
        }
    }

    /// Resolve the edge `source -> target`, propagating deadness downstream.
    fn resolve(&mut self, graph: &WorkflowGraph, source: usize, target: usize, fired: bool) {
        let mut stack = vec![(source, target, fired)];
        while let Some((from, idx, fired)) = stack.pop() {
            self.pending_in[idx] = self.pending_in[idx].saturating_sub(1);
            if fired {
                self.fired_from[idx].push(from);
            }
            if self.pending_in[idx] > 0 {
                continue;
            }
            if self.fired_from[idx].is_empty() {
                stack.extend(graph.outgoing(idx).map(|(_, next)| (idx, next, false)));
            } else {
                self.ready.push(idx);
            }
        }
    }

    fn take_wave(&mut self) -> Vec<usize> {
        let mut wave = std::mem::take(&mut self.ready);
        wave.sort_unstable();
        wave.dedup();
        wave
    }

    /// Node ids of the parents that fed `idx`.
    fn sources<'g>(&self, graph: &'g WorkflowGraph, idx: usize) -> impl Iterator<Item = &'g str> {
        self.fired_from[idx]
            .iter()
            .map(move |&from| graph.node(from).node.id.as_str())
    }
}

/// Outputs that can end up as the run output.
#[derive(Default)]
struct RunOutputs {
    ends: BTreeMap<String, Value>,
    /// Completed nodes none of whose outgoing edges fired.
    sinks: BTreeMap<String, Value>,
}

impl RunOutputs {
    /// `end` outputs win over other sinks. A single candidate is returned as
    /// is; several are keyed by node id.
    fn into_value(self) -> Value {
        let mut outputs = if self.ends.is_empty() { self.sinks } else { self.ends };
        if outputs.len() <= 1 {
            return outputs.pop_first().map(|(_, v)| v).unwrap_or(Value::Null);
        }
        Value::Object(outputs.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The execution engine.
///
/// Generic over the repository and queue so the same engine runs against
/// SQLite in production and in-memory stores in tests.
pub struct WorkflowEngine<R: WorkflowRepository, Q: JobQueue> {
    repo: Arc<R>,
    queue: Arc<Q>,
    registry: Arc<NodeExecutorRegistry>,
    checkpoints: Checkpointer<R>,
    event_bus: EventBus,
    budget: Arc<dyn BudgetGuard>,
    config: EngineSettings,
    job_max_attempts: u32,
    /// Cancellation tokens for runs traversing in this process.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowRepository, Q: JobQueue> WorkflowEngine<R, Q> {
    pub fn new(
        repo: Arc<R>,
        queue: Arc<Q>,
        registry: Arc<NodeExecutorRegistry>,
        config: EngineSettings,
    ) -> Self {
        Self {
            checkpoints: Checkpointer::new(repo.clone()),
            repo,
            queue,
            registry,
            event_bus: EventBus::new(config.event_capacity),
            budget: Arc::new(AllowAllBudget),
            config,
            job_max_attempts: 3,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn with_budget(mut self, budget: Arc<dyn BudgetGuard>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_job_max_attempts(mut self, attempts: u32) -> Self {
        self.job_max_attempts = attempts.max(1);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn registry(&self) -> &NodeExecutorRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and persist a workflow definition.
    pub async fn create_workflow(&self, mut workflow: Workflow) -> Result<Workflow, EngineError> {
        WorkflowGraph::build(&workflow)?;
        self.check_executors(&workflow)?;
        workflow.updated_at = Utc::now();
        self.repo.save_workflow(&workflow).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            nodes = workflow.nodes.len(),
            edges = workflow.edges.len(),
            "workflow saved"
        );
        Ok(workflow)
    }

    fn check_executors(&self, workflow: &Workflow) -> Result<(), EngineError> {
        for node in &workflow.nodes {
            match node.kind() {
                Some(kind) if self.registry.contains(kind) => {}
                _ => return Err(EngineError::UnknownNodeType(node.node_type.clone())),
            }
        }
        Ok(())
    }

    async fn load_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.repo
            .get_workflow(&id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    /// Start an execution.
    ///
    /// The execution row is persisted as `pending` before any node runs.
    /// Async executions are handed to the job queue and return `queued`;
    /// synchronous ones run to a terminal status or `waiting`.
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        triggered_by: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<ExecuteResponse, EngineError> {
        let workflow = self.load_workflow(workflow_id).await?;
        if !workflow.status.is_runnable() {
            return Err(ValidationError::WorkflowNotRunnable {
                status: workflow.status,
            }
            .into());
        }
        let graph = WorkflowGraph::build(&workflow)?;
        self.check_executors(&workflow)?;

        let execution = WorkflowExecution::new(
            workflow.id,
            workflow.version,
            triggered_by,
            input,
            options.priority,
        );
        self.repo.create_execution(&execution).await?;
        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            triggered_by,
            async_mode = options.async_mode,
            "execution created"
        );

        if options.async_mode {
            let job = self
                .queue
                .enqueue(
                    NewJob::start(execution.id, options.priority)
                        .with_max_attempts(self.job_max_attempts),
                )
                .await?;
            let patch = ExecutionPatch {
                job_id: Some(job.id),
                ..Default::default()
            };
            self.repo
                .transition_execution(
                    &execution.id,
                    &[ExecutionStatus::Pending],
                    ExecutionStatus::Queued,
                    patch,
                )
                .await?;
            tracing::debug!(execution_id = %execution.id, job_id = %job.id, "execution queued");
            return Ok(ExecuteResponse {
                execution_id: execution.id,
                status: ExecutionStatus::Queued,
            });
        }

        let (execution_id, status) = self.start_run(&workflow, &graph, execution).await?;
        Ok(ExecuteResponse {
            execution_id,
            status,
        })
    }

    /// Claim a pending/queued execution and run it from the start node.
    ///
    /// Returns the execution id with its resulting status. If the execution
    /// is no longer claimable the call is a no-op that reports the current
    /// status.
    async fn start_run(
        &self,
        workflow: &Workflow,
        graph: &WorkflowGraph,
        execution: WorkflowExecution,
    ) -> Result<(Uuid, ExecutionStatus), EngineError> {
        let id = execution.id;
        let started_at = Utc::now();
        let claimed = self
            .repo
            .transition_execution(
                &id,
                &[ExecutionStatus::Pending, ExecutionStatus::Queued],
                ExecutionStatus::Running,
                ExecutionPatch {
                    started_at: Some(started_at),
                    ..Default::default()
                },
            )
            .await?;
        if !claimed {
            let status = self.current_status(id).await?;
            tracing::info!(execution_id = %id, status = %status, "execution not claimable, skipping start");
            return Ok((id, status));
        }

        self.event_bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: id,
            workflow_id: workflow.id,
            triggered_by: execution.triggered_by.clone(),
        });
        tracing::info!(execution_id = %id, workflow_id = %workflow.id, "execution started");

        if let Err(reason) = self.budget.check_run(workflow.id, id).await {
            let error = EngineError::BudgetExceeded(reason).to_string();
            let status = self.finish_failed(workflow, id, started_at, error).await?;
            return Ok((id, status));
        }

        let ctx = ExecutionContext::seed(id, workflow.id, &workflow.variables, execution.input);
        let status = self.drive(workflow, graph, ctx, HashMap::new(), started_at).await?;
        Ok((id, status))
    }

    /// Continue a `running` execution by replaying its recorded node states.
    async fn continue_execution(&self, execution: WorkflowExecution) -> Result<ExecutionStatus, EngineError> {
        let workflow = self.load_workflow(execution.workflow_id).await?;
        let graph = match WorkflowGraph::build(&workflow) {
            Ok(graph) => graph,
            Err(e) => {
                let started_at = execution.started_at.unwrap_or_else(Utc::now);
                return self
                    .finish_failed(&workflow, execution.id, started_at, e.to_string())
                    .await;
            }
        };
        let memo = replay_memo(&execution);
        let ctx = ExecutionContext::seed(
            execution.id,
            workflow.id,
            &workflow.variables,
            execution.input.clone(),
        );
        let started_at = execution.started_at.unwrap_or_else(Utc::now);
        tracing::info!(
            execution_id = %execution.id,
            replayed = memo.len(),
            "continuing execution"
        );
        self.drive(&workflow, &graph, ctx, memo, started_at).await
    }

    /// Traverse under the run timeout and persist the terminal outcome.
    async fn drive(
        &self,
        workflow: &Workflow,
        graph: &WorkflowGraph,
        mut ctx: ExecutionContext,
        memo: HashMap<String, NodeState>,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionStatus, EngineError> {
        let id = ctx.execution_id;
        let token = CancellationToken::new();
        self.cancellation_tokens.insert(id, token.clone());

        let limit = Duration::from_secs(self.config.workflow_timeout_secs);
        let traversal =
            tokio::time::timeout(limit, self.traverse(graph, &mut ctx, &memo, &token)).await;
        self.cancellation_tokens.remove(&id);

        match traversal {
            Err(_) => {
                tracing::warn!(execution_id = %id, timeout_secs = self.config.workflow_timeout_secs, "execution timed out");
                let error = EngineError::Timeout(self.config.workflow_timeout_secs).to_string();
                self.finish_failed(workflow, id, started_at, error).await
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(Outcome::Completed(output))) => {
                self.finish_completed(workflow, id, started_at, output).await
            }
            Ok(Ok(Outcome::Failed(error))) => {
                self.finish_failed(workflow, id, started_at, error).await
            }
            Ok(Ok(Outcome::Suspended)) => Ok(ExecutionStatus::Waiting),
            Ok(Ok(Outcome::Cancelled)) => {
                tracing::info!(execution_id = %id, "traversal stopped by cancellation");
                self.current_status(id).await
            }
        }
    }

    async fn traverse(
        &self,
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
        memo: &HashMap<String, NodeState>,
        token: &CancellationToken,
    ) -> Result<Outcome, EngineError> {
        let execution_id = ctx.execution_id;
        let mut frontier = Frontier::new(graph);
        let mut outputs = RunOutputs::default();

        loop {
            let wave = frontier.take_wave();
            if wave.is_empty() {
                break;
            }
            if token.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let replayed: HashMap<usize, Value> = wave
                .iter()
                .filter_map(|&idx| {
                    memo.get(&graph.node(idx).node.id)
                        .map(|state| (idx, state.output.clone().unwrap_or(Value::Null)))
                })
                .collect();

            let snapshot: &ExecutionContext = ctx;
            let pending: Vec<(usize, Value)> = wave
                .iter()
                .filter(|idx| !replayed.contains_key(idx))
                .map(|&idx| (idx, snapshot.input_from(frontier.sources(graph, idx))))
                .collect();
            let runs = pending.into_iter().map(|(idx, input)| {
                let entry = graph.node(idx);
                async move {
                    let scope = snapshot.scope(&entry.node.id, input);
                    let started = Utc::now();
                    let result = self.registry.dispatch(entry.kind, &entry.node, &scope).await;
                    (idx, started, Utc::now(), result)
                }
            });
            let mut results: HashMap<usize, _> = self
                .with_heartbeat(execution_id, join_all(runs))
                .await
                .into_iter()
                .map(|(idx, started, finished, result)| (idx, (started, finished, result)))
                .collect();

            let mut suspend_at: Option<(usize, NodeResult, DateTime<Utc>)> = None;

            for idx in wave {
                let entry = graph.node(idx);
                let node_id = entry.node.id.as_str();

                if let Some(output) = replayed.get(&idx) {
                    tracing::debug!(execution_id = %execution_id, node_id, "replaying recorded output");
                    if let Err(e) =
                        self.apply_output(graph, idx, output.clone(), ctx, &mut frontier, &mut outputs)
                    {
                        return Ok(Outcome::Failed(e));
                    }
                    continue;
                }

                let Some((started, finished, result)) = results.remove(&idx) else {
                    continue;
                };
                let result = match result {
                    Ok(result) => result,
                    Err(e) => NodeResult::fail(e.to_string()),
                };

                if result.suspend.is_some() {
                    if suspend_at.is_none() {
                        suspend_at = Some((idx, result, started));
                    }
                    continue;
                }

                if !result.success {
                    let error = result.error.clone().unwrap_or_else(|| "node failed".to_string());
                    self.checkpoints
                        .record_failed(execution_id, node_id, &error, result.output.clone(), started, finished)
                        .await?;
                    self.checkpoints
                        .record_logs(execution_id, node_id, LogLevel::Info, &result.logs)
                        .await?;
                    self.event_bus.publish(WorkflowEvent::NodeFailed {
                        execution_id,
                        node_id: node_id.to_string(),
                        error: error.clone(),
                    });
                    tracing::warn!(execution_id = %execution_id, node_id, error = %error, "node failed");
                    return Ok(Outcome::Failed(
                        EngineError::NodeExecution {
                            node_id: node_id.to_string(),
                            error,
                        }
                        .to_string(),
                    ));
                }

                let output = result.output.clone().unwrap_or(Value::Null);
                let state = self
                    .checkpoints
                    .record_completed(execution_id, node_id, output.clone(), started, finished)
                    .await?;
                let level = log_level(entry.kind, &output);
                self.checkpoints
                    .record_logs(execution_id, node_id, level, &result.logs)
                    .await?;
                self.event_bus.publish(WorkflowEvent::NodeCompleted {
                    execution_id,
                    node_id: node_id.to_string(),
                    duration_ms: state.duration_ms.unwrap_or(0),
                });
                tracing::debug!(execution_id = %execution_id, node_id, kind = %entry.kind, "node completed");

                if let Err(e) = self.apply_output(graph, idx, output, ctx, &mut frontier, &mut outputs) {
                    return Ok(Outcome::Failed(e));
                }
            }

            if let Some((idx, result, started)) = suspend_at {
                let node_id = graph.node(idx).node.id.as_str();
                let Some(request) = result.suspend else {
                    continue;
                };
                let approval = self
                    .checkpoints
                    .suspend(execution_id, node_id, &request, self.config.approval_ttl_secs, started)
                    .await?;
                return match approval {
                    Some(approval) => {
                        self.event_bus.publish(WorkflowEvent::ExecutionWaiting {
                            execution_id,
                            approval_id: approval.id,
                            node_id: node_id.to_string(),
                        });
                        tracing::info!(
                            execution_id = %execution_id,
                            node_id,
                            approval_id = %approval.id,
                            "execution waiting for approval"
                        );
                        Ok(Outcome::Suspended)
                    }
                    None => Ok(Outcome::Cancelled),
                };
            }
        }

        Ok(Outcome::Completed(outputs.into_value()))
    }

    /// Await a wave, refreshing the run's `last_progress_at` every
    /// `heartbeat_secs` so a slow wave is not mistaken for a zombie.
    async fn with_heartbeat<T>(&self, execution_id: Uuid, wave: impl Future<Output = T>) -> T {
        let period = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(wave);
        loop {
            tokio::select! {
                out = &mut wave => return out,
                _ = ticker.tick() => {
                    match self.repo.touch_execution(&execution_id, Utc::now()).await {
                        Ok(_) => tracing::trace!(execution_id = %execution_id, "progress heartbeat"),
                        Err(e) => tracing::warn!(execution_id = %execution_id, error = %e, "progress heartbeat failed"),
                    }
                }
            }
        }
    }

    /// Fold a node's output into the context and resolve its outgoing edges.
    fn apply_output(
        &self,
        graph: &WorkflowGraph,
        idx: usize,
        output: Value,
        ctx: &mut ExecutionContext,
        frontier: &mut Frontier,
        outputs: &mut RunOutputs,
    ) -> Result<(), String> {
        let entry = graph.node(idx);
        let node_id = entry.node.id.as_str();
        if entry.kind == NodeKind::SetVariable {
            if let Value::Object(assigned) = &output {
                ctx.assign_variables(assigned);
            }
        }
        ctx.set_node_output(node_id, output)?;

        let view = ctx.view();
        let stored = ctx.node_output(node_id).cloned().unwrap_or(Value::Null);
        let resolved: Vec<(usize, bool)> = graph
            .outgoing(idx)
            .map(|(edge, target)| (target, edge_fires(entry.kind, &stored, edge, &view)))
            .collect();

        if entry.kind == NodeKind::End {
            outputs.ends.insert(node_id.to_string(), stored);
        } else if !resolved.iter().any(|&(_, fired)| fired) {
            outputs.sinks.insert(node_id.to_string(), stored);
        }
        for (target, fired) in resolved {
            frontier.resolve(graph, idx, target, fired);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn finish_completed(
        &self,
        workflow: &Workflow,
        id: Uuid,
        started_at: DateTime<Utc>,
        output: Value,
    ) -> Result<ExecutionStatus, EngineError> {
        let now = Utc::now();
        let duration_ms = elapsed_ms(started_at, now);
        let moved = self
            .repo
            .transition_execution(
                &id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Completed,
                ExecutionPatch {
                    completed_at: Some(now),
                    output: Some(output),
                    duration_ms: Some(duration_ms),
                    ..Default::default()
                },
            )
            .await?;
        if !moved {
            let status = self.current_status(id).await?;
            tracing::info!(execution_id = %id, status = %status, "completion skipped, execution already moved on");
            return Ok(status);
        }

        self.repo
            .append_log(&id, &ExecutionLog::info(None, format!("execution completed in {duration_ms}ms")))
            .await?;
        self.repo
            .record_execution_metrics(&workflow.id, true, duration_ms, now)
            .await?;
        self.event_bus.publish(WorkflowEvent::ExecutionCompleted {
            execution_id: id,
            workflow_id: workflow.id,
            duration_ms,
        });
        tracing::info!(execution_id = %id, workflow_id = %workflow.id, duration_ms, "execution completed");
        Ok(ExecutionStatus::Completed)
    }

    async fn finish_failed(
        &self,
        workflow: &Workflow,
        id: Uuid,
        started_at: DateTime<Utc>,
        error: String,
    ) -> Result<ExecutionStatus, EngineError> {
        let now = Utc::now();
        let duration_ms = elapsed_ms(started_at, now);
        let moved = self
            .repo
            .transition_execution(
                &id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Failed,
                ExecutionPatch {
                    completed_at: Some(now),
                    error: Some(error.clone()),
                    duration_ms: Some(duration_ms),
                    ..Default::default()
                },
            )
            .await?;
        if !moved {
            let status = self.current_status(id).await?;
            tracing::info!(execution_id = %id, status = %status, "failure skipped, execution already moved on");
            return Ok(status);
        }

        self.repo.append_log(&id, &ExecutionLog::error(None, error.clone())).await?;
        self.repo
            .record_execution_metrics(&workflow.id, false, duration_ms, now)
            .await?;
        self.event_bus.publish(WorkflowEvent::ExecutionFailed {
            execution_id: id,
            workflow_id: workflow.id,
            error: error.clone(),
        });
        tracing::warn!(execution_id = %id, workflow_id = %workflow.id, error = %error, "execution failed");
        Ok(ExecutionStatus::Failed)
    }

    async fn current_status(&self, id: Uuid) -> Result<ExecutionStatus, EngineError> {
        Ok(self
            .repo
            .get_execution(&id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))?
            .status)
    }

    // -----------------------------------------------------------------------
    // Queries and control
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.repo
            .get_execution(&id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.repo.list_executions(&workflow_id, limit, offset).await?)
    }

    /// Cancel an execution. A no-op that reports the current status when the
    /// execution is already terminal.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<ExecutionStatus, EngineError> {
        let execution = self.get_execution(id).await?;
        if execution.status.is_terminal() {
            return Ok(execution.status);
        }

        if let Some(job_id) = execution.job_id {
            if self.queue.cancel(&job_id).await? {
                tracing::debug!(execution_id = %id, job_id = %job_id, "job cancelled");
            }
        }
        if let Some(token) = self.cancellation_tokens.get(&id) {
            token.cancel();
        }

        match self.repo.cancel_execution(&id, Utc::now()).await? {
            Some(previous) => {
                self.event_bus
                    .publish(WorkflowEvent::ExecutionCancelled { execution_id: id });
                tracing::info!(execution_id = %id, previous = %previous, "execution cancelled");
                Ok(ExecutionStatus::Cancelled)
            }
            None => self.current_status(id).await,
        }
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Resolve a pending approval and, when approved, continue the run.
    pub async fn resume_approval(
        &self,
        approval_id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<ExecuteResponse, EngineError> {
        let approval = self
            .repo
            .get_approval(&approval_id)
            .await?
            .ok_or(EngineError::ApprovalNotFound(approval_id))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(EngineError::ApprovalNotPending {
                id: approval_id,
                status: approval.status,
            });
        }
        let now = Utc::now();
        if approval.is_expired_at(now) {
            return Err(EngineError::ApprovalExpired { approval_id });
        }

        let execution_id = approval.execution_id;
        let resolution = if decision.approved {
            let output = json!({
                "approved": true,
                "decidedBy": decision.decided_by,
                "comment": decision.comment,
            });
            ApprovalResolution {
                approval_id,
                execution_id,
                decision: decision.clone(),
                node_state: Some(
                    NodeState::completed(approval.node_id.clone(), output).timed(approval.created_at, now),
                ),
                error: None,
                now,
            }
        } else {
            let by = decision
                .decided_by
                .as_deref()
                .map(|d| format!(" by {d}"))
                .unwrap_or_default();
            ApprovalResolution {
                approval_id,
                execution_id,
                decision: decision.clone(),
                node_state: None,
                error: Some(format!("approval '{}' rejected{by}", approval.title)),
                now,
            }
        };

        if !self.repo.resolve_approval(&resolution).await? {
            return Err(EngineError::ApprovalConflict(approval_id));
        }
        tracing::info!(
            execution_id = %execution_id,
            approval_id = %approval_id,
            approved = decision.approved,
            decided_by = decision.decided_by.as_deref().unwrap_or("-"),
            "approval resolved"
        );

        let execution = self.get_execution(execution_id).await?;

        if !decision.approved {
            let started_at = execution.started_at.unwrap_or(approval.created_at);
            self.repo
                .record_execution_metrics(&execution.workflow_id, false, elapsed_ms(started_at, now), now)
                .await?;
            self.event_bus.publish(WorkflowEvent::ExecutionFailed {
                execution_id,
                workflow_id: execution.workflow_id,
                error: resolution.error.unwrap_or_default(),
            });
            return Ok(ExecuteResponse {
                execution_id,
                status: ExecutionStatus::Error,
            });
        }

        self.event_bus.publish(WorkflowEvent::NodeCompleted {
            execution_id,
            node_id: approval.node_id.clone(),
            duration_ms: elapsed_ms(approval.created_at, now),
        });

        if self.config.async_resume {
            let job = self
                .queue
                .enqueue(NewJob::resume(execution_id, execution.priority).with_max_attempts(self.job_max_attempts))
                .await?;
            tracing::debug!(execution_id = %execution_id, job_id = %job.id, "resume job enqueued");
            return Ok(ExecuteResponse {
                execution_id,
                status: ExecutionStatus::Running,
            });
        }

        let status = self.continue_execution(execution).await?;
        Ok(ExecuteResponse { execution_id, status })
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Run a claimed job. Redelivered jobs whose execution has moved on are
    /// logged no-ops.
    pub async fn process_job(&self, job: &Job) -> Result<ExecutionStatus, EngineError> {
        let Some(execution) = self.repo.get_execution(&job.execution_id).await? else {
            tracing::warn!(job_id = %job.id, execution_id = %job.execution_id, "job references a missing execution");
            return Err(EngineError::ExecutionNotFound(job.execution_id));
        };

        match job.kind {
            JobKind::Start => {
                if !matches!(execution.status, ExecutionStatus::Pending | ExecutionStatus::Queued) {
                    tracing::info!(
                        job_id = %job.id,
                        execution_id = %execution.id,
                        status = %execution.status,
                        "start job redelivered for a claimed execution, ignoring"
                    );
                    return Ok(execution.status);
                }
                let workflow = self.load_workflow(execution.workflow_id).await?;
                let graph = WorkflowGraph::build(&workflow)?;
                let (_, status) = self.start_run(&workflow, &graph, execution).await?;
                Ok(status)
            }
            JobKind::Resume => {
                if execution.status != ExecutionStatus::Running {
                    tracing::info!(
                        job_id = %job.id,
                        execution_id = %execution.id,
                        status = %execution.status,
                        "resume job for an execution that is not running, ignoring"
                    );
                    return Ok(execution.status);
                }
                self.continue_execution(execution).await
            }
        }
    }

    /// Give up on a job that will never be delivered again.
    ///
    /// An execution that never left the queue is moved to `error` so it does
    /// not sit in `queued` forever. Anything further along is left to the
    /// cleanup worker. Returns whether the execution was moved.
    pub async fn abandon_job(&self, job: &Job, reason: &str) -> Result<bool, EngineError> {
        let now = Utc::now();
        let moved = self
            .repo
            .transition_execution(
                &job.execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Queued],
                ExecutionStatus::Error,
                ExecutionPatch {
                    completed_at: Some(now),
                    error: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        if !moved {
            return Ok(false);
        }

        self.repo
            .append_log(&job.execution_id, &ExecutionLog::error(None, reason.to_string()))
            .await?;
        if let Some(execution) = self.repo.get_execution(&job.execution_id).await? {
            self.event_bus.publish(WorkflowEvent::ExecutionFailed {
                execution_id: execution.id,
                workflow_id: execution.workflow_id,
                error: reason.to_string(),
            });
        }
        tracing::warn!(job_id = %job.id, execution_id = %job.execution_id, reason, "job abandoned");
        Ok(true)
    }
}

/// Whether `edge` fires after its source (of `kind`) produced `output`.
fn edge_fires(kind: NodeKind, output: &Value, edge: &Edge, view: &Value) -> bool {
    if kind == NodeKind::End {
        return false;
    }
    if let Some(handle) = edge.source_handle.as_deref() {
        match kind {
            NodeKind::Condition => {
                let result = output.get("result").is_some_and(is_truthy);
                if handle != if result { "true" } else { "false" } {
                    return false;
                }
            }
            NodeKind::HumanApproval => {
                if handle != "approved" {
                    return false;
                }
            }
            _ => {}
        }
    }
    match &edge.condition {
        Some(condition) => evaluate(condition, view),
        None => true,
    }
}

fn log_level(kind: NodeKind, output: &Value) -> LogLevel {
    if kind != NodeKind::Log {
        return LogLevel::Info;
    }
    output
        .get("level")
        .and_then(Value::as_str)
        .and_then(|l| LogLevel::from_str(l).ok())
        .unwrap_or(LogLevel::Info)
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::budget::TokenBudget;
    use crate::workflow::nodes::BuiltinServices;
    use crate::workflow::nodes::http::tests::MockHttp;
    use crate::workflow::test_support::{MemoryRepository, edge, engine, engine_with, node, workflow};
    use flowgate_types::execution::NodeStatus;
    use flowgate_types::workflow::{Condition, ConditionOperator, WorkflowStatus};
    use crate::queue::JobQueue;

    fn sync() -> ExecuteOptions {
        ExecuteOptions::default()
    }

    fn http_services(status: u16) -> (Arc<MockHttp>, BuiltinServices) {
        let mock = Arc::new(MockHttp::new(status, json!({"ok": true})));
        let services = BuiltinServices {
            http: Some(mock.clone()),
            ..Default::default()
        };
        (mock, services)
    }

    /// trigger -> score check -> (true) fetch -> done, (false) low.
    fn branching_workflow() -> Workflow {
        workflow(
            vec![
                node("trigger", NodeKind::Trigger, Value::Null),
                node("check", NodeKind::Condition, json!({"field": "score", "operator": ">", "value": 70})),
                node("fetch", NodeKind::Http, json!({"url": "https://api.example.test/{{score}}"})),
                node("done", NodeKind::End, json!({"output": {"fetched": "{{fetch.body.ok}}"}})),
                node("low", NodeKind::End, json!({"output": {"fetched": false}})),
            ],
            vec![
                edge("trigger", "check"),
                edge("check", "fetch").with_handle("true"),
                edge("check", "low").with_handle("false"),
                edge("fetch", "done"),
            ],
        )
    }

    fn approval_workflow() -> Workflow {
        workflow(
            vec![
                node("trigger", NodeKind::Trigger, Value::Null),
                node("gate", NodeKind::HumanApproval, json!({"title": "Refund {{amount}}?"})),
                node("done", NodeKind::End, json!({"output": {"refunded": "{{amount}}"}})),
            ],
            vec![
                edge("trigger", "gate"),
                edge("gate", "done").with_handle("approved"),
            ],
        )
    }

    fn triples(execution: &WorkflowExecution) -> Vec<(String, NodeStatus, Option<Value>)> {
        execution
            .node_states
            .iter()
            .map(|s| (s.node_id.clone(), s.status, s.output.clone()))
            .collect()
    }

    async fn pending_approval(repo: &MemoryRepository, execution_id: Uuid) -> Uuid {
        repo.list_approvals(&execution_id).await.unwrap()[0].id
    }

    #[tokio::test]
    async fn single_trigger_outputs_its_input() {
        let (_, engine) = engine();
        let wf = engine
            .create_workflow(workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]))
            .await
            .unwrap();

        let response = engine.execute(wf.id, "test", json!({"x": 1}), sync()).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.output, Some(json!({"x": 1})));
        assert_eq!(execution.node_states.len(), 1);
        assert!(execution.started_at.is_some());
        assert!(execution.completed_at.is_some());
        assert!(execution.duration_ms.is_some());
    }

    #[tokio::test]
    async fn branch_not_taken_is_absent_from_node_states() {
        let (mock, services) = http_services(200);
        let (repo, engine) = engine_with(services, EngineSettings::default());
        let wf = engine.create_workflow(branching_workflow()).await.unwrap();

        let response = engine.execute(wf.id, "test", json!({"score": 85}), sync()).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        let ran: Vec<_> = execution.node_states.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ran, vec!["trigger", "check", "fetch", "done"]);
        assert_eq!(execution.output, Some(json!({"fetched": true})));
        assert_eq!(mock.seen.lock().unwrap()[0].url, "https://api.example.test/85");

        let stored = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.metrics.total_executions, 1);
        assert_eq!(stored.metrics.successful_executions, 1);
    }

    #[tokio::test]
    async fn false_branch_skips_http() {
        let (mock, services) = http_services(200);
        let (_, engine) = engine_with(services, EngineSettings::default());
        let wf = engine.create_workflow(branching_workflow()).await.unwrap();

        let response = engine.execute(wf.id, "test", json!({"score": 10}), sync()).await.unwrap();
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        let ran: Vec<_> = execution.node_states.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ran, vec!["trigger", "check", "low"]);
        assert_eq!(execution.output, Some(json!({"fetched": false})));
        assert!(mock.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn identical_runs_record_identical_states() {
        let (_, services) = http_services(200);
        let (_, engine) = engine_with(services, EngineSettings::default());
        let wf = engine.create_workflow(branching_workflow()).await.unwrap();

        let a = engine.execute(wf.id, "test", json!({"score": 99}), sync()).await.unwrap();
        let b = engine.execute(wf.id, "test", json!({"score": 99}), sync()).await.unwrap();
        let a = engine.get_execution(a.execution_id).await.unwrap();
        let b = engine.get_execution(b.execution_id).await.unwrap();
        assert_eq!(triples(&a), triples(&b));
        assert_eq!(a.output, b.output);
    }

    #[tokio::test]
    async fn join_runs_once_after_dead_branch() {
        let (_, engine) = engine();
        let wf = workflow(
            vec![
                node("t", NodeKind::Trigger, Value::Null),
                node("c", NodeKind::Condition, json!({"field": "vip", "operator": "==", "value": true})),
                node("yes", NodeKind::Transform, json!({"template": {"tier": "gold"}})),
                node("no", NodeKind::Transform, json!({"template": {"tier": "basic"}})),
                node("join", NodeKind::Transform, json!({"template": {"yes": "{{yes.tier}}", "no": "{{no.tier}}"}})),
            ],
            vec![
                edge("t", "c"),
                edge("c", "yes").with_handle("true"),
                edge("c", "no").with_handle("false"),
                edge("yes", "join"),
                edge("no", "join"),
            ],
        );
        let wf = engine.create_workflow(wf).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({"vip": true}), sync()).await.unwrap();
        let execution = engine.get_execution(response.execution_id).await.unwrap();

        let joins = execution.node_states.iter().filter(|s| s.node_id == "join").count();
        assert_eq!(joins, 1);
        assert!(execution.latest_state("no").is_none());
        // The dead branch's token stays verbatim.
        assert_eq!(execution.output, Some(json!({"yes": "gold", "no": "{{no.tier}}"})));
    }

    /// t -> a, t -> b, a -> after_a. `after_a` passes its input through.
    fn sibling_workflow(a_first: bool) -> Workflow {
        let a = node("a", NodeKind::Transform, json!({"template": "A"}));
        let b = node("b", NodeKind::Transform, json!({"template": "B"}));
        let siblings = if a_first { vec![a, b] } else { vec![b, a] };
        let mut nodes = vec![node("t", NodeKind::Trigger, Value::Null)];
        nodes.extend(siblings);
        nodes.push(node("after_a", NodeKind::Delay, json!({"ms": 0})));
        workflow(nodes, vec![edge("t", "a"), edge("t", "b"), edge("a", "after_a")])
    }

    #[tokio::test]
    async fn node_input_comes_from_its_own_upstream() {
        let (_, engine) = engine();
        let mut seen = Vec::new();
        for a_first in [true, false] {
            let wf = engine.create_workflow(sibling_workflow(a_first)).await.unwrap();
            let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
            let execution = engine.get_execution(response.execution_id).await.unwrap();
            assert_eq!(execution.latest_state("after_a").unwrap().output, Some(json!("A")));
            seen.push(execution.output);
        }
        // Both sinks contribute, keyed by node id, whatever the definition order.
        assert_eq!(seen[0], Some(json!({"after_a": "A", "b": "B"})));
        assert_eq!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn join_input_is_keyed_by_parent() {
        let (_, engine) = engine();
        let wf = workflow(
            vec![
                node("t", NodeKind::Trigger, Value::Null),
                node("right", NodeKind::Transform, json!({"template": 2})),
                node("left", NodeKind::Transform, json!({"template": 1})),
                node("join", NodeKind::Transform, json!({})),
            ],
            vec![
                edge("t", "right"),
                edge("t", "left"),
                edge("right", "join"),
                edge("left", "join"),
            ],
        );
        let wf = engine.create_workflow(wf).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.output, Some(json!({"left": 1, "right": 2})));
    }

    #[tokio::test]
    async fn edge_conditions_gate_traversal() {
        let (_, engine) = engine();
        let wf = workflow(
            vec![
                node("t", NodeKind::Trigger, Value::Null),
                node("big", NodeKind::Transform, json!({"template": "big"})),
                node("small", NodeKind::Transform, json!({"template": "small"})),
            ],
            vec![
                edge("t", "big").with_condition(Condition::new("amount", ConditionOperator::Gte, json!(100))),
                edge("t", "small").with_condition(Condition::new("amount", ConditionOperator::Lt, json!(100))),
            ],
        );
        let wf = engine.create_workflow(wf).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({"amount": 250}), sync()).await.unwrap();
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert!(execution.latest_state("big").is_some());
        assert!(execution.latest_state("small").is_none());
        assert_eq!(execution.output, Some(json!("big")));
    }

    #[tokio::test]
    async fn set_variable_feeds_later_nodes() {
        let (_, engine) = engine();
        let mut wf = workflow(
            vec![
                node("t", NodeKind::Trigger, Value::Null),
                node("set", NodeKind::SetVariable, json!({"variables": {"greeting": "hello {{name}}"}})),
                node("out", NodeKind::End, json!({"output": "{{greeting}}"})),
            ],
            vec![edge("t", "set"), edge("set", "out")],
        );
        wf.variables = vec![flowgate_types::workflow::VariableDefinition {
            name: "greeting".into(),
            default: json!("unset"),
        }];
        let wf = engine.create_workflow(wf).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({"name": "ada"}), sync()).await.unwrap();
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.output, Some(json!("hello ada")));
    }

    #[tokio::test]
    async fn node_failure_fails_run_and_keeps_partial_states() {
        let (_, services) = http_services(500);
        let (repo, engine) = engine_with(services, EngineSettings::default());
        let wf = engine.create_workflow(branching_workflow()).await.unwrap();

        let response = engine.execute(wf.id, "test", json!({"score": 85}), sync()).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Failed);

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.latest_state("fetch").unwrap().status, NodeStatus::Failed);
        assert!(execution.latest_state("done").is_none());
        assert!(execution.error.unwrap().contains("fetch"));

        let stored = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.metrics.failed_executions, 1);
    }

    #[tokio::test]
    async fn unregistered_node_type_is_rejected_before_persisting() {
        let (repo, engine) = engine();
        let wf = branching_workflow();
        let err = engine.create_workflow(wf.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownNodeType(ref t) if t == "http"));

        // Saved behind the engine's back, execution still refuses it.
        repo.save_workflow(&wf).await.unwrap();
        let err = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownNodeType(_)));
        assert!(repo.list_executions(&wf.id, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archived_workflow_is_not_runnable() {
        let (_, engine) = engine();
        let mut wf = workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]);
        wf.status = WorkflowStatus::Archived;
        let wf = engine.create_workflow(wf).await.unwrap();
        let err = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::WorkflowNotRunnable { .. })
        ));
    }

    #[tokio::test]
    async fn budget_denial_fails_run() {
        let (_, engine) = engine();
        let engine = engine.with_budget(Arc::new(TokenBudget::new(0)));
        let wf = engine
            .create_workflow(workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]))
            .await
            .unwrap();
        let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Failed);
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert!(execution.error.unwrap().contains("budget exceeded"));
        assert!(execution.node_states.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_fails_execution() {
        let config = EngineSettings {
            workflow_timeout_secs: 1,
            ..Default::default()
        };
        let (_, engine) = engine_with(BuiltinServices::default(), config);
        let wf = workflow(
            vec![
                node("t", NodeKind::Trigger, Value::Null),
                node("wait", NodeKind::Delay, json!({"ms": 60_000})),
            ],
            vec![edge("t", "wait")],
        );
        let wf = engine.create_workflow(wf).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Failed);
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert!(execution.error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_wave_keeps_progress_fresh() {
        let config = EngineSettings {
            heartbeat_secs: 1,
            ..Default::default()
        };
        let (repo, engine) = engine_with(BuiltinServices::default(), config);
        let wf = workflow(
            vec![
                node("t", NodeKind::Trigger, Value::Null),
                node("wait", NodeKind::Delay, json!({"ms": 3_500})),
            ],
            vec![edge("t", "wait")],
        );
        let wf = engine.create_workflow(wf).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);
        assert!(repo.touches.load(std::sync::atomic::Ordering::Relaxed) >= 3);
    }

    #[tokio::test]
    async fn events_follow_the_run() {
        let (_, engine) = engine();
        let mut rx = engine.event_bus().subscribe();
        let wf = engine
            .create_workflow(workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]))
            .await
            .unwrap();
        engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();

        let topics: Vec<_> = std::iter::from_fn(|| rx.try_recv()).map(|e| e.topic()).collect();
        assert_eq!(
            topics,
            vec!["workflow.started", "workflow.node.completed", "workflow.completed"]
        );
    }

    // -- approvals ---------------------------------------------------------

    #[tokio::test]
    async fn approval_suspends_then_resumes_to_completion() {
        let (repo, engine) = engine();
        let wf = engine.create_workflow(approval_workflow()).await.unwrap();

        let response = engine.execute(wf.id, "test", json!({"amount": 40}), sync()).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Waiting);

        let approvals = repo.list_approvals(&response.execution_id).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].title, "Refund 40?");
        assert_eq!(approvals[0].status, ApprovalStatus::Pending);

        let resumed = engine
            .resume_approval(approvals[0].id, ApprovalDecision::approve("ops").with_comment("fine"))
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.output, Some(json!({"refunded": 40})));
        let statuses: Vec<_> = execution
            .node_states
            .iter()
            .map(|s| (s.node_id.as_str(), s.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("trigger", NodeStatus::Completed),
                ("gate", NodeStatus::Waiting),
                ("gate", NodeStatus::Completed),
                ("done", NodeStatus::Completed),
            ]
        );
        // The trigger was replayed, not executed again.
        assert_eq!(execution.node_states.iter().filter(|s| s.node_id == "trigger").count(), 1);
        let gate = execution.latest_state("gate").unwrap();
        assert_eq!(gate.output.as_ref().unwrap()["decidedBy"], json!("ops"));
    }

    #[tokio::test]
    async fn rejection_ends_in_error() {
        let (repo, engine) = engine();
        let wf = engine.create_workflow(approval_workflow()).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({"amount": 1}), sync()).await.unwrap();
        let approval_id = pending_approval(&repo, response.execution_id).await;

        let resumed = engine
            .resume_approval(approval_id, ApprovalDecision::reject("ops"))
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Error);

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert!(execution.error.unwrap().contains("rejected by ops"));
        assert_eq!(
            repo.get_approval(&approval_id).await.unwrap().unwrap().status,
            ApprovalStatus::Rejected
        );
    }

    #[tokio::test]
    async fn concurrent_resumes_have_exactly_one_winner() {
        let (repo, engine) = engine();
        let wf = engine.create_workflow(approval_workflow()).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({"amount": 5}), sync()).await.unwrap();
        let approval_id = pending_approval(&repo, response.execution_id).await;

        let (a, b) = tokio::join!(
            engine.resume_approval(approval_id, ApprovalDecision::approve("alice")),
            engine.resume_approval(approval_id, ApprovalDecision::approve("bob")),
        );
        let wins = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let loser = if a.is_ok() { b.unwrap_err() } else { a.unwrap_err() };
        assert!(matches!(
            loser,
            EngineError::ApprovalConflict(_) | EngineError::ApprovalNotPending { .. }
        ));

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.node_states.iter().filter(|s| s.node_id == "done").count(), 1);
    }

    #[tokio::test]
    async fn expired_approval_cannot_be_resumed() {
        let (repo, engine) = engine();
        let wf = engine.create_workflow(approval_workflow()).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
        let approval_id = pending_approval(&repo, response.execution_id).await;
        repo.update_approval(approval_id, |a| a.expires_at = Utc::now() - chrono::Duration::seconds(1));

        let err = engine
            .resume_approval(approval_id, ApprovalDecision::approve("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalExpired { .. }));
    }

    #[tokio::test]
    async fn unknown_approval_is_not_found() {
        let (_, engine) = engine();
        let err = engine
            .resume_approval(Uuid::now_v7(), ApprovalDecision::approve("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn async_resume_goes_through_the_queue() {
        let config = EngineSettings {
            async_resume: true,
            ..Default::default()
        };
        let (repo, engine) = engine_with(BuiltinServices::default(), config);
        let wf = engine.create_workflow(approval_workflow()).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({"amount": 9}), sync()).await.unwrap();
        let approval_id = pending_approval(&repo, response.execution_id).await;

        let resumed = engine
            .resume_approval(approval_id, ApprovalDecision::approve("ops"))
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);

        let job = engine.queue().claim("w1").await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::Resume);
        let status = engine.process_job(&job).await.unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
    }

    // -- cancellation and jobs ----------------------------------------------

    #[tokio::test]
    async fn cancel_waiting_execution_rejects_approval() {
        let (repo, engine) = engine();
        let wf = engine.create_workflow(approval_workflow()).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
        let approval_id = pending_approval(&repo, response.execution_id).await;

        let status = engine.cancel_execution(response.execution_id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);
        assert_eq!(
            repo.get_approval(&approval_id).await.unwrap().unwrap().status,
            ApprovalStatus::Rejected
        );

        // Second cancel is a no-op.
        let again = engine.cancel_execution(response.execution_id).await.unwrap();
        assert_eq!(again, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_completed_execution_is_a_noop() {
        let (_, engine) = engine();
        let wf = engine
            .create_workflow(workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]))
            .await
            .unwrap();
        let response = engine.execute(wf.id, "test", json!({}), sync()).await.unwrap();
        let status = engine.cancel_execution(response.execution_id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn async_execute_queues_then_worker_completes() {
        let (_, engine) = engine();
        let wf = engine
            .create_workflow(workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]))
            .await
            .unwrap();
        let options = ExecuteOptions {
            async_mode: true,
            priority: 5,
        };
        let response = engine.execute(wf.id, "api", json!({"q": 1}), options).await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Queued);

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Queued);
        assert!(execution.job_id.is_some());

        let job = engine.queue().claim("w1").await.unwrap().unwrap();
        assert_eq!(job.priority, 5);
        assert_eq!(engine.process_job(&job).await.unwrap(), ExecutionStatus::Completed);

        // Redelivery is a no-op.
        assert_eq!(engine.process_job(&job).await.unwrap(), ExecutionStatus::Completed);
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.node_states.len(), 1);
    }

    #[tokio::test]
    async fn cancelling_queued_execution_cancels_its_job() {
        let (_, engine) = engine();
        let wf = engine
            .create_workflow(workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]))
            .await
            .unwrap();
        let options = ExecuteOptions {
            async_mode: true,
            priority: 0,
        };
        let response = engine.execute(wf.id, "api", json!({}), options).await.unwrap();
        assert_eq!(
            engine.cancel_execution(response.execution_id).await.unwrap(),
            ExecutionStatus::Cancelled
        );
        assert!(engine.queue().claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_executions_is_newest_first_without_states() {
        let (_, engine) = engine();
        let wf = engine
            .create_workflow(workflow(vec![node("t", NodeKind::Trigger, Value::Null)], vec![]))
            .await
            .unwrap();
        let first = engine.execute(wf.id, "a", json!({}), sync()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = engine.execute(wf.id, "b", json!({}), sync()).await.unwrap();

        let listed = engine.list_executions(wf.id, 10, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.execution_id);
        assert_eq!(listed[1].id, first.execution_id);
        assert!(listed.iter().all(|e| e.node_states.is_empty()));

        let paged = engine.list_executions(wf.id, 1, 1).await.unwrap();
        assert_eq!(paged[0].id, first.execution_id);
    }
}
