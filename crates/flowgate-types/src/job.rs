//! Queue jobs. Each job drives exactly one execution.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a worker should do with the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Start a queued execution from its start node.
    Start,
    /// Continue an execution after its approval was granted.
    Resume,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Resume => "resume",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "resume" => Ok(Self::Resume),
            other => Err(format!("invalid job kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

/// A job as stored by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub kind: JobKind,
    /// Higher runs first.
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub execution_id: Uuid,
    pub kind: JobKind,
    pub priority: i32,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn start(execution_id: Uuid, priority: i32) -> Self {
        Self {
            execution_id,
            kind: JobKind::Start,
            priority,
            max_attempts: 3,
        }
    }

    pub fn resume(execution_id: Uuid, priority: i32) -> Self {
        Self {
            execution_id,
            kind: JobKind::Resume,
            priority,
            max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Materialize into a queued job with a fresh id.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::now_v7(),
            execution_id: self.execution_id,
            kind: self.kind,
            priority: self.priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts,
            claimed_by: None,
            last_error: None,
            created_at: now,
            claimed_at: None,
            completed_at: None,
        }
    }
}
