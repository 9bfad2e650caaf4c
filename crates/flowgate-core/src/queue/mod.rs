//! Job queue port.
//!
//! The queue delivers execution jobs to workers at least once. A job is
//! claimed by at most one worker at a time; a claim that is never acked is
//! handed out again after its lease expires (`requeue_stale`).

pub mod memory;

use std::future::Future;
use std::time::Duration;

use flowgate_types::error::QueueError;
use flowgate_types::job::{Job, NewJob};
use uuid::Uuid;

pub use memory::InMemoryJobQueue;

/// Durable delivery of execution jobs to a worker pool.
pub trait JobQueue: Send + Sync {
    /// Add a job in `queued` state.
    fn enqueue(&self, job: NewJob) -> impl Future<Output = Result<Job, QueueError>> + Send;

    /// Claim the next job: highest priority first, then oldest.
    fn claim(&self, worker_id: &str) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send;

    /// Mark a claimed job as done.
    fn ack(&self, job_id: &Uuid) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Release a claimed job after a failure. It is requeued until it has
    /// used `max_attempts`, then marked failed. Returns whether it was requeued.
    fn nack(&self, job_id: &Uuid, error: &str) -> impl Future<Output = Result<bool, QueueError>> + Send;

    /// Cancel a queued or claimed job. Returns whether anything changed.
    fn cancel(&self, job_id: &Uuid) -> impl Future<Output = Result<bool, QueueError>> + Send;

    /// Return claims older than `lease` to the queue. Returns how many.
    fn requeue_stale(&self, lease: Duration) -> impl Future<Output = Result<u64, QueueError>> + Send;

    fn get(&self, job_id: &Uuid) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send;
}
