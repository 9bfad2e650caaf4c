//! Process-local job queue for single-node deployments and tests.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use flowgate_types::error::QueueError;
use flowgate_types::job::{Job, JobStatus, NewJob};
use uuid::Uuid;

use super::JobQueue;

/// In-memory `JobQueue`. Jobs are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently waiting to be claimed.
    pub fn queued_len(&self) -> usize {
        self.lock()
            .map(|jobs| jobs.iter().filter(|j| j.status == JobStatus::Queued).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Job>>, QueueError> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::Backend("job queue mutex poisoned".into()))
    }
}

impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let job = job.into_job(Utc::now());
        self.lock()?.push(job.clone());
        Ok(job)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.lock()?;
        // Jobs are appended in creation order, so the first max wins ties.
        let next = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Queued)
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
            .map(|(i, _)| i);

        Ok(next.map(|i| {
            let job = &mut jobs[i];
            job.status = JobStatus::Claimed;
            job.attempts += 1;
            job.claimed_by = Some(worker_id.to_string());
            job.claimed_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn ack(&self, job_id: &Uuid) -> Result<(), QueueError> {
        let mut jobs = self.lock()?;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == *job_id)
            .ok_or(QueueError::NotFound)?;
        if job.status == JobStatus::Claimed {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn nack(&self, job_id: &Uuid, error: &str) -> Result<bool, QueueError> {
        let mut jobs = self.lock()?;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == *job_id)
            .ok_or(QueueError::NotFound)?;
        if job.status != JobStatus::Claimed {
            return Ok(false);
        }
        job.last_error = Some(error.to_string());
        job.claimed_by = None;
        if job.attempts >= job.max_attempts {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            Ok(false)
        } else {
            job.status = JobStatus::Queued;
            Ok(true)
        }
    }

    async fn cancel(&self, job_id: &Uuid) -> Result<bool, QueueError> {
        let mut jobs = self.lock()?;
        match jobs.iter_mut().find(|j| j.id == *job_id) {
            Some(job) if matches!(job.status, JobStatus::Queued | JobStatus::Claimed) => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| QueueError::Backend(format!("invalid lease: {e}")))?;
        let cutoff = Utc::now() - lease;
        let mut requeued = 0;
        for job in self.lock()?.iter_mut() {
            if job.status == JobStatus::Claimed && job.claimed_at.is_some_and(|t| t <= cutoff) {
                job.status = JobStatus::Queued;
                job.claimed_by = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn get(&self, job_id: &Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.lock()?.iter().find(|j| j.id == *job_id).cloned())
    }
}
