//! SQLite-backed job queue.
//!
//! Claiming is a select-then-conditional-update inside one writer
//! transaction; the `status = 'queued'` guard on the update means a job can
//! never be handed to two workers even if another process shares the file.

use std::time::Duration;

use chrono::Utc;
use flowgate_core::queue::JobQueue;
use flowgate_types::error::QueueError;
use flowgate_types::job::{Job, NewJob};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::workflow::{format_datetime, parse_datetime, parse_uuid};

pub struct SqliteJobQueue {
    pool: DatabasePool,
}

impl SqliteJobQueue {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Number of jobs waiting to be claimed.
    pub async fn queued_len(&self) -> Result<u64, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(backend)?;
        Ok(count as u64)
    }
}

fn backend(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let get_str = |col: &str| -> Result<String, QueueError> { row.try_get(col).map_err(backend) };
    let get_opt = |col: &str| -> Result<Option<String>, QueueError> { row.try_get(col).map_err(backend) };
    let opt_time = |col: &str| -> Result<_, QueueError> {
        get_opt(col)?
            .as_deref()
            .map(parse_datetime)
            .transpose()
            .map_err(QueueError::from)
    };

    Ok(Job {
        id: parse_uuid(&get_str("id")?)?,
        execution_id: parse_uuid(&get_str("execution_id")?)?,
        kind: get_str("kind")?.parse().map_err(QueueError::Backend)?,
        priority: row.try_get::<i64, _>("priority").map_err(backend)? as i32,
        status: get_str("status")?.parse().map_err(QueueError::Backend)?,
        attempts: row.try_get::<i64, _>("attempts").map_err(backend)? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts").map_err(backend)? as u32,
        claimed_by: get_opt("claimed_by")?,
        last_error: get_opt("last_error")?,
        created_at: parse_datetime(&get_str("created_at")?)?,
        claimed_at: opt_time("claimed_at")?,
        completed_at: opt_time("completed_at")?,
    })
}

impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let job = job.into_job(Utc::now());
        sqlx::query(
            r#"INSERT INTO jobs (id, execution_id, kind, priority, status, attempts, max_attempts, created_at)
               VALUES (?, ?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.execution_id.to_string())
        .bind(job.kind.as_str())
        .bind(job.priority as i64)
        .bind(job.status.as_str())
        .bind(job.max_attempts as i64)
        .bind(format_datetime(&job.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;
        Ok(job)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut tx = self.pool.writer.begin().await.map_err(backend)?;
        let Some((id,)): Option<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE status = 'queued' ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?
        else {
            tx.rollback().await.map_err(backend)?;
            return Ok(None);
        };

        let claimed = sqlx::query(
            r#"UPDATE jobs SET status = 'claimed', attempts = attempts + 1, claimed_by = ?, claimed_at = ?
               WHERE id = ? AND status = 'queued'"#,
        )
        .bind(worker_id)
        .bind(format_datetime(&Utc::now()))
        .bind(&id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await.map_err(backend)?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;
        let job = job_from_row(&row)?;
        tx.commit().await.map_err(backend)?;
        Ok(Some(job))
    }

    async fn ack(&self, job_id: &Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ? WHERE id = ? AND status = 'claimed'",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 && self.get(job_id).await?.is_none() {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    async fn nack(&self, job_id: &Uuid, error: &str) -> Result<bool, QueueError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            r#"UPDATE jobs SET
                 last_error = ?,
                 claimed_by = NULL,
                 status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'queued' END,
                 completed_at = CASE WHEN attempts >= max_attempts THEN ? ELSE completed_at END
               WHERE id = ? AND status = 'claimed'
               RETURNING status"#,
        )
        .bind(error)
        .bind(&now)
        .bind(job_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(backend)?;

        match result {
            Some(row) => {
                let status: String = row.try_get("status").map_err(backend)?;
                Ok(status == "queued")
            }
            None if self.get(job_id).await?.is_none() => Err(QueueError::NotFound),
            None => Ok(false),
        }
    }

    async fn cancel(&self, job_id: &Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ? WHERE id = ? AND status IN ('queued', 'claimed')",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| QueueError::Backend(format!("invalid lease: {e}")))?;
        let cutoff = Utc::now() - lease;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', claimed_by = NULL WHERE status = 'claimed' AND claimed_at <= ?",
        )
        .bind(format_datetime(&cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: &Uuid) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(backend)?;
        row.as_ref().map(job_from_row).transpose()
    }
}
