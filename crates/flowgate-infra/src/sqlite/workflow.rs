//! SQLite workflow repository.
//!
//! Implements `WorkflowRepository` from `flowgate-core` using sqlx with split
//! read/write pools. Workflow graphs are stored as JSON blobs; node states
//! and logs are append-only child tables ordered by rowid.
//!
//! Every status change is an `UPDATE ... WHERE status IN (...)` and reports
//! `rows_affected() > 0`, so concurrent callers race safely: exactly one
//! wins and the rest observe `false`.

use chrono::{DateTime, SecondsFormat, Utc};
use flowgate_core::repository::workflow::{ApprovalResolution, Repair, WorkflowRepository};
use flowgate_types::approval::ApprovalRequest;
use flowgate_types::error::RepositoryError;
use flowgate_types::execution::{
    AuditEntry, ExecutionLog, ExecutionPatch, ExecutionStatus, LogLevel, NodeState,
    WorkflowExecution,
};
use flowgate_types::workflow::{Edge, Node, VariableDefinition, Workflow, WorkflowMetrics};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn db_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.as_deref().map(parse_datetime).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn parse_json_opt(s: Option<String>, what: &str) -> Result<Option<Value>, RepositoryError> {
    s.as_deref()
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
        })
        .transpose()
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, RepositoryError> {
    s.parse::<T>().map_err(RepositoryError::Query)
}

/// `?, ?, ?` for an `IN (...)` list of `n` binds.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

const NON_TERMINAL: [ExecutionStatus; 4] = [
    ExecutionStatus::Pending,
    ExecutionStatus::Queued,
    ExecutionStatus::Running,
    ExecutionStatus::Waiting,
];

/// The graph portion of a workflow, stored in `workflows.definition`.
#[derive(Serialize)]
struct GraphRef<'a> {
    nodes: &'a [Node],
    edges: &'a [Edge],
    variables: &'a [VariableDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    trigger_config: Option<&'a Value>,
}

#[derive(Deserialize)]
struct GraphBlob {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    variables: Vec<VariableDefinition>,
    #[serde(default)]
    trigger_config: Option<Value>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow, RepositoryError> {
    let definition: String = row.try_get("definition").map_err(db_err)?;
    let graph: GraphBlob = serde_json::from_str(&definition)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let version: i64 = row.try_get("version").map_err(db_err)?;

    Ok(Workflow {
        id: parse_uuid(&row.try_get::<String, _>("id").map_err(db_err)?)?,
        name: row.try_get("name").map_err(db_err)?,
        version: version as u32,
        status: parse_enum(&status)?,
        nodes: graph.nodes,
        edges: graph.edges,
        variables: graph.variables,
        trigger_config: graph.trigger_config,
        metrics: WorkflowMetrics {
            total_executions: row.try_get::<i64, _>("total_executions").map_err(db_err)? as u64,
            successful_executions: row.try_get::<i64, _>("successful_executions").map_err(db_err)?
                as u64,
            failed_executions: row.try_get::<i64, _>("failed_executions").map_err(db_err)? as u64,
            avg_duration_ms: row.try_get("avg_duration_ms").map_err(db_err)?,
            last_executed_at: parse_opt_datetime(row.try_get("last_executed_at").map_err(db_err)?)?,
        },
        created_at: parse_datetime(&row.try_get::<String, _>("created_at").map_err(db_err)?)?,
        updated_at: parse_datetime(&row.try_get::<String, _>("updated_at").map_err(db_err)?)?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<WorkflowExecution, RepositoryError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let input: String = row.try_get("input").map_err(db_err)?;
    let job_id: Option<String> = row.try_get("job_id").map_err(db_err)?;
    let duration_ms: Option<i64> = row.try_get("duration_ms").map_err(db_err)?;
    let version: i64 = row.try_get("workflow_version").map_err(db_err)?;
    let priority: i64 = row.try_get("priority").map_err(db_err)?;

    Ok(WorkflowExecution {
        id: parse_uuid(&row.try_get::<String, _>("id").map_err(db_err)?)?,
        workflow_id: parse_uuid(&row.try_get::<String, _>("workflow_id").map_err(db_err)?)?,
        workflow_version: version as u32,
        status: parse_enum(&status)?,
        triggered_by: row.try_get("triggered_by").map_err(db_err)?,
        priority: priority as i32,
        input: serde_json::from_str(&input)
            .map_err(|e| RepositoryError::Query(format!("invalid input JSON: {e}")))?,
        output: parse_json_opt(row.try_get("output").map_err(db_err)?, "output")?,
        error: row.try_get("error").map_err(db_err)?,
        node_states: Vec::new(),
        logs: Vec::new(),
        job_id: job_id.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_datetime(&row.try_get::<String, _>("created_at").map_err(db_err)?)?,
        started_at: parse_opt_datetime(row.try_get("started_at").map_err(db_err)?)?,
        last_progress_at: parse_opt_datetime(row.try_get("last_progress_at").map_err(db_err)?)?,
        completed_at: parse_opt_datetime(row.try_get("completed_at").map_err(db_err)?)?,
        duration_ms: duration_ms.map(|d| d as u64),
    })
}

fn node_state_from_row(row: &SqliteRow) -> Result<NodeState, RepositoryError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let duration_ms: Option<i64> = row.try_get("duration_ms").map_err(db_err)?;
    Ok(NodeState {
        node_id: row.try_get("node_id").map_err(db_err)?,
        status: parse_enum(&status)?,
        output: parse_json_opt(row.try_get("output").map_err(db_err)?, "node output")?,
        error: row.try_get("error").map_err(db_err)?,
        started_at: parse_opt_datetime(row.try_get("started_at").map_err(db_err)?)?,
        completed_at: parse_opt_datetime(row.try_get("completed_at").map_err(db_err)?)?,
        duration_ms: duration_ms.map(|d| d as u64),
    })
}

fn log_from_row(row: &SqliteRow) -> Result<ExecutionLog, RepositoryError> {
    let level: String = row.try_get("level").map_err(db_err)?;
    Ok(ExecutionLog {
        timestamp: parse_datetime(&row.try_get::<String, _>("timestamp").map_err(db_err)?)?,
        level: parse_enum(&level)?,
        node_id: row.try_get("node_id").map_err(db_err)?,
        message: row.try_get("message").map_err(db_err)?,
    })
}

fn approval_from_row(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(ApprovalRequest {
        id: parse_uuid(&row.try_get::<String, _>("id").map_err(db_err)?)?,
        execution_id: parse_uuid(&row.try_get::<String, _>("execution_id").map_err(db_err)?)?,
        node_id: row.try_get("node_id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        status: parse_enum(&status)?,
        decided_by: row.try_get("decided_by").map_err(db_err)?,
        comment: row.try_get("comment").map_err(db_err)?,
        expires_at: parse_datetime(&row.try_get::<String, _>("expires_at").map_err(db_err)?)?,
        created_at: parse_datetime(&row.try_get::<String, _>("created_at").map_err(db_err)?)?,
        resolved_at: parse_opt_datetime(row.try_get("resolved_at").map_err(db_err)?)?,
    })
}

fn ids_from_rows(rows: &[SqliteRow]) -> Result<Vec<Uuid>, RepositoryError> {
    rows.iter()
        .map(|row| parse_uuid(&row.try_get::<String, _>("id").map_err(db_err)?))
        .collect()
}

// ---------------------------------------------------------------------------
// Transaction building blocks
// ---------------------------------------------------------------------------

async fn insert_node_state(
    tx: &mut Transaction<'_, Sqlite>,
    execution_id: &Uuid,
    state: &NodeState,
) -> Result<(), RepositoryError> {
    let output = state.output.as_ref().map(|v| to_json(v, "node output")).transpose()?;
    sqlx::query(
        r#"INSERT INTO node_states
           (execution_id, node_id, status, output, error, started_at, completed_at, duration_ms)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(execution_id.to_string())
    .bind(&state.node_id)
    .bind(state.status.as_str())
    .bind(output)
    .bind(&state.error)
    .bind(state.started_at.as_ref().map(format_datetime))
    .bind(state.completed_at.as_ref().map(format_datetime))
    .bind(state.duration_ms.map(|d| d as i64))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_log(
    tx: &mut Transaction<'_, Sqlite>,
    execution_id: &Uuid,
    log: &ExecutionLog,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO execution_logs (execution_id, timestamp, level, node_id, message) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(execution_id.to_string())
    .bind(format_datetime(&log.timestamp))
    .bind(log.level.as_str())
    .bind(&log.node_id)
    .bind(&log.message)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Move a repaired execution from `from` to `error`, then log and audit it.
/// Rolls back (returns `false`) if the guard no longer matches.
async fn force_error(
    mut tx: Transaction<'_, Sqlite>,
    repair: &Repair,
    guard_sql: &str,
    guard_binds: &[String],
) -> Result<bool, RepositoryError> {
    let now = format_datetime(&repair.now);
    let sql = format!(
        "UPDATE executions SET status = 'error', error = ?, completed_at = ? WHERE id = ? AND {guard_sql}"
    );
    let mut query = sqlx::query(&sql)
        .bind(&repair.diagnostic)
        .bind(&now)
        .bind(repair.execution_id.to_string());
    for bind in guard_binds {
        query = query.bind(bind.as_str());
    }
    let result = query.execute(&mut *tx).await.map_err(db_err)?;
    if result.rows_affected() == 0 {
        tx.rollback().await.map_err(db_err)?;
        return Ok(false);
    }

    insert_log(
        &mut tx,
        &repair.execution_id,
        &ExecutionLog {
            timestamp: repair.now,
            level: LogLevel::Error,
            node_id: None,
            message: repair.diagnostic.clone(),
        },
    )
    .await?;
    sqlx::query("INSERT INTO audit_log (execution_id, action, detail, created_at) VALUES (?, ?, ?, ?)")
        .bind(repair.execution_id.to_string())
        .bind(repair.action)
        .bind(&repair.diagnostic)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

    tx.commit().await.map_err(db_err)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let definition = to_json(
            &GraphRef {
                nodes: &workflow.nodes,
                edges: &workflow.edges,
                variables: &workflow.variables,
                trigger_config: workflow.trigger_config.as_ref(),
            },
            "workflow definition",
        )?;

        sqlx::query(
            r#"INSERT INTO workflows (id, name, version, status, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 status = excluded.status,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(workflow.version as i64)
        .bind(workflow.status.as_str())
        .bind(&definition)
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflows ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn record_execution_metrics(
        &self,
        workflow_id: &Uuid,
        success: bool,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        // All right-hand sides read the pre-update row.
        let result = sqlx::query(
            r#"UPDATE workflows SET
                 avg_duration_ms = (avg_duration_ms * total_executions + ?) / (total_executions + 1),
                 total_executions = total_executions + 1,
                 successful_executions = successful_executions + ?,
                 failed_executions = failed_executions + ?,
                 last_executed_at = ?
               WHERE id = ?"#,
        )
        .bind(duration_ms as f64)
        .bind(i64::from(success))
        .bind(i64::from(!success))
        .bind(format_datetime(&finished_at))
        .bind(workflow_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let output = execution.output.as_ref().map(|v| to_json(v, "output")).transpose()?;
        sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, workflow_version, status, triggered_by, priority, input, output,
                error, job_id, created_at, started_at, last_progress_at, completed_at, duration_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.workflow_version as i64)
        .bind(execution.status.as_str())
        .bind(&execution.triggered_by)
        .bind(execution.priority as i64)
        .bind(to_json(&execution.input, "input")?)
        .bind(output)
        .bind(&execution.error)
        .bind(execution.job_id.map(|id| id.to_string()))
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.last_progress_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.duration_ms.map(|d| d as i64))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(execution.id.to_string())
            }
            other => db_err(other),
        })?;
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let Some(row) = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };
        let mut execution = execution_from_row(&row)?;

        let states = sqlx::query("SELECT * FROM node_states WHERE execution_id = ? ORDER BY id ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        execution.node_states = states.iter().map(node_state_from_row).collect::<Result<_, _>>()?;

        let logs = sqlx::query("SELECT * FROM execution_logs WHERE execution_id = ? ORDER BY id ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        execution.logs = logs.iter().map(log_from_row).collect::<Result<_, _>>()?;

        Ok(Some(execution))
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE workflow_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(workflow_id.to_string())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn transition_execution(
        &self,
        id: &Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let output = patch.output.as_ref().map(|v| to_json(v, "output")).transpose()?;
        let sql = format!(
            r#"UPDATE executions SET
                 status = ?,
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at),
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 duration_ms = COALESCE(?, duration_ms),
                 job_id = COALESCE(?, job_id)
               WHERE id = ? AND status IN ({})"#,
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(patch.started_at.as_ref().map(format_datetime))
            .bind(patch.completed_at.as_ref().map(format_datetime))
            .bind(output)
            .bind(patch.error)
            .bind(patch.duration_ms.map(|d| d as i64))
            .bind(patch.job_id.map(|j| j.to_string()))
            .bind(id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool.writer).await.map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_node_state(&self, execution_id: &Uuid, state: &NodeState) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        let touched = sqlx::query("UPDATE executions SET last_progress_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if touched.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(RepositoryError::NotFound);
        }
        insert_node_state(&mut tx, execution_id, state).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn touch_execution(&self, id: &Uuid, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE executions SET last_progress_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(format_datetime(&at))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_log(&self, execution_id: &Uuid, log: &ExecutionLog) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        insert_log(&mut tx, execution_id, log).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn cancel_execution(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionStatus>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        let Some(row) = sqlx::query("SELECT status FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
        else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };
        let previous: ExecutionStatus = parse_enum(&row.try_get::<String, _>("status").map_err(db_err)?)?;
        if previous.is_terminal() {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }

        let now = format_datetime(&now);
        let sql = format!(
            "UPDATE executions SET status = 'cancelled', completed_at = ? WHERE id = ? AND status IN ({})",
            placeholders(NON_TERMINAL.len())
        );
        let mut query = sqlx::query(&sql).bind(&now).bind(id.to_string());
        for status in NON_TERMINAL {
            query = query.bind(status.as_str());
        }
        if query.execute(&mut *tx).await.map_err(db_err)?.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }

        sqlx::query(
            r#"UPDATE approval_requests SET status = 'rejected', resolved_at = ?, comment = 'execution cancelled'
               WHERE execution_id = ? AND status = 'pending'"#,
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(previous))
    }

    async fn suspend_execution(
        &self,
        execution_id: &Uuid,
        state: &NodeState,
        approval: &ApprovalRequest,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        let moved = sqlx::query(
            "UPDATE executions SET status = 'waiting', last_progress_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(execution_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if moved.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        insert_node_state(&mut tx, execution_id, state).await?;
        sqlx::query(
            r#"INSERT INTO approval_requests
               (id, execution_id, node_id, title, description, status, expires_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(approval.id.to_string())
        .bind(approval.execution_id.to_string())
        .bind(&approval.node_id)
        .bind(&approval.title)
        .bind(&approval.description)
        .bind(approval.status.as_str())
        .bind(format_datetime(&approval.expires_at))
        .bind(format_datetime(&approval.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn get_approval(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(approval_from_row).transpose()
    }

    async fn list_approvals(&self, execution_id: &Uuid) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM approval_requests WHERE execution_id = ? ORDER BY created_at ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(approval_from_row).collect()
    }

    async fn resolve_approval(&self, resolution: &ApprovalResolution) -> Result<bool, RepositoryError> {
        let now = format_datetime(&resolution.now);
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        let decided = sqlx::query(
            r#"UPDATE approval_requests SET status = ?, decided_by = ?, comment = ?, resolved_at = ?
               WHERE id = ? AND status = 'pending' AND expires_at > ?"#,
        )
        .bind(resolution.decision.status().as_str())
        .bind(&resolution.decision.decided_by)
        .bind(&resolution.decision.comment)
        .bind(&now)
        .bind(resolution.approval_id.to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if decided.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        if resolution.decision.approved {
            let resumed = sqlx::query(
                "UPDATE executions SET status = 'running', last_progress_at = ? WHERE id = ? AND status = 'waiting'",
            )
            .bind(&now)
            .bind(resolution.execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            if resumed.rows_affected() > 0 {
                if let Some(state) = &resolution.node_state {
                    insert_node_state(&mut tx, &resolution.execution_id, state).await?;
                }
            }
        } else {
            sqlx::query(
                "UPDATE executions SET status = 'error', error = ?, completed_at = ? WHERE id = ? AND status = 'waiting'",
            )
            .bind(&resolution.error)
            .bind(&now)
            .bind(resolution.execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn list_zombie_candidates(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id FROM executions
               WHERE status = 'running' AND COALESCE(last_progress_at, started_at) < ?
               ORDER BY COALESCE(last_progress_at, started_at) ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&cutoff))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        ids_from_rows(&rows)
    }

    async fn reap_zombie(&self, repair: &Repair, cutoff: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let tx = self.pool.writer.begin().await.map_err(db_err)?;
        force_error(
            tx,
            repair,
            "status = 'running' AND COALESCE(last_progress_at, started_at) < ?",
            &[format_datetime(&cutoff)],
        )
        .await
    }

    async fn list_expired_approvals(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_requests WHERE status = 'pending' AND expires_at < ? ORDER BY expires_at ASC LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(approval_from_row).collect()
    }

    async fn expire_approval(&self, approval_id: &Uuid, repair: &Repair) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        let expired = sqlx::query(
            "UPDATE approval_requests SET status = 'expired', resolved_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(format_datetime(&repair.now))
        .bind(approval_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if expired.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        let waiting: Option<(String,)> =
            sqlx::query_as("SELECT id FROM executions WHERE id = ? AND status = 'waiting'")
                .bind(repair.execution_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        if waiting.is_none() {
            tx.commit().await.map_err(db_err)?;
            return Ok(true);
        }
        force_error(tx, repair, "status = 'waiting'", &[]).await?;
        Ok(true)
    }

    async fn list_orphaned_executions(&self, limit: u32) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT e.id FROM executions e
               WHERE e.status = 'waiting'
                 AND NOT EXISTS (
                   SELECT 1 FROM approval_requests a WHERE a.execution_id = e.id AND a.status = 'pending'
                 )
               ORDER BY e.created_at ASC
               LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        ids_from_rows(&rows)
    }

    async fn repair_orphan(&self, repair: &Repair) -> Result<bool, RepositoryError> {
        let tx = self.pool.writer.begin().await.map_err(db_err)?;
        force_error(
            tx,
            repair,
            r#"status = 'waiting' AND NOT EXISTS (
                 SELECT 1 FROM approval_requests a WHERE a.execution_id = executions.id AND a.status = 'pending'
               )"#,
            &[],
        )
        .await
    }

    async fn list_audit_entries(&self, execution_id: &Uuid) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM audit_log WHERE execution_id = ? ORDER BY id ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(AuditEntry {
                    execution_id: parse_uuid(&row.try_get::<String, _>("execution_id").map_err(db_err)?)?,
                    action: row.try_get("action").map_err(db_err)?,
                    detail: row.try_get("detail").map_err(db_err)?,
                    created_at: parse_datetime(&row.try_get::<String, _>("created_at").map_err(db_err)?)?,
                })
            })
            .collect()
    }
}
