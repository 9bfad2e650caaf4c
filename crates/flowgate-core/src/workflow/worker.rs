//! Queue worker pool.
//!
//! `concurrency` tasks each loop claim -> `process_job` -> ack. Transient
//! failures are nacked so the queue can redeliver them; a job that runs out
//! of attempts, or fails permanently, is abandoned. One more task hands
//! expired claims back to the queue so a crashed worker's jobs are retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flowgate_types::config::WorkerSettings;
use flowgate_types::error::QueueError;
use flowgate_types::execution::ExecutionStatus;
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::queue::JobQueue;
use crate::repository::workflow::WorkflowRepository;

use super::engine::WorkflowEngine;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Claims held longer than this are returned to the queue.
    pub lease: Duration,
    /// How often to look for expired claims.
    pub requeue_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            lease: Duration::from_secs(settings.lease_secs.max(1)),
            requeue_interval: Duration::from_secs((settings.lease_secs / 4).max(1)),
        }
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Processed and acked; the execution ended up in this status.
    Processed(ExecutionStatus),
    /// Failed transiently and went back to the queue.
    Retrying(String),
    /// Will not be delivered again.
    Abandoned(String),
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub retried: AtomicU64,
    pub abandoned: AtomicU64,
    pub requeued_stale: AtomicU64,
}

pub struct WorkerPool<R: WorkflowRepository, Q: JobQueue> {
    engine: Arc<WorkflowEngine<R, Q>>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
}

impl<R, Q> WorkerPool<R, Q>
where
    R: WorkflowRepository + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(engine: Arc<WorkflowEngine<R, Q>>, config: WorkerConfig) -> Self {
        Self {
            engine,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Claim and run one job. `Ok(None)` means the queue was empty.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobOutcome>, QueueError> {
        let queue = self.engine.queue();
        let Some(job) = queue.claim(worker_id).await? else {
            return Ok(None);
        };
        debug!(
            worker_id,
            job_id = %job.id,
            execution_id = %job.execution_id,
            kind = job.kind.as_str(),
            attempt = job.attempts,
            "job claimed"
        );

        let outcome = match self.engine.process_job(&job).await {
            Ok(status) => {
                queue.ack(&job.id).await?;
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                JobOutcome::Processed(status)
            }
            Err(e) if e.is_transient() => {
                let message = e.to_string();
                if queue.nack(&job.id, &message).await? {
                    warn!(worker_id, job_id = %job.id, error = %message, "job failed, will retry");
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    JobOutcome::Retrying(message)
                } else {
                    let reason = format!("job failed after {} attempts: {message}", job.attempts);
                    self.abandon(&job, &reason).await;
                    JobOutcome::Abandoned(reason)
                }
            }
            Err(e) => {
                // Redelivery cannot help; consume the job.
                let reason = e.to_string();
                queue.ack(&job.id).await?;
                self.abandon(&job, &reason).await;
                JobOutcome::Abandoned(reason)
            }
        };
        Ok(Some(outcome))
    }

    async fn abandon(&self, job: &flowgate_types::job::Job, reason: &str) {
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        error!(job_id = %job.id, execution_id = %job.execution_id, reason, "abandoning job");
        if let Err(e) = self.engine.abandon_job(job, reason).await {
            error!(error = %e, job_id = %job.id, "failed to mark abandoned job's execution");
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(worker_id = %worker_id, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let idle = match self.run_once(&worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, worker_id = %worker_id, "queue error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        debug!(worker_id = %worker_id, "worker stopped");
    }

    async fn requeue_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.requeue_interval) => {
                    match self.engine.queue().requeue_stale(self.config.lease).await {
                        Ok(0) => {}
                        Ok(n) => {
                            self.stats.requeued_stale.fetch_add(n, Ordering::Relaxed);
                            warn!(requeued = n, "returned expired job claims to the queue");
                        }
                        Err(e) => error!(error = %e, "failed to requeue stale jobs"),
                    }
                }
            }
        }
    }

    /// Run all workers until shutdown is signalled. In-flight jobs finish
    /// before this returns.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let pool = Arc::new(self);
        info!(
            concurrency = pool.config.concurrency,
            poll_interval_ms = pool.config.poll_interval.as_millis() as u64,
            lease_secs = pool.config.lease.as_secs(),
            "worker pool started"
        );
        let mut tasks = Vec::with_capacity(pool.config.concurrency + 1);
        for i in 0..pool.config.concurrency {
            let worker_id = format!("worker-{i}");
            tasks.push(tokio::spawn(pool.clone().worker_loop(worker_id, shutdown_rx.clone())));
        }
        tasks.push(tokio::spawn(pool.clone().requeue_loop(shutdown_rx)));

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool shut down");
    }
}

/// Spawn a worker pool. Send `true` on the returned sender to stop it.
pub fn spawn_worker_pool<R, Q>(
    pool: WorkerPool<R, Q>,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>)
where
    R: WorkflowRepository + 'static,
    Q: JobQueue + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(pool.run(shutdown_rx));
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::engine::ExecuteOptions;
    use crate::workflow::test_support::{edge, engine, node, workflow};
    use flowgate_types::job::{JobStatus, NewJob};
    use flowgate_types::workflow::NodeKind;
    use serde_json::{Value, json};
    use uuid::Uuid;

    fn async_opts() -> ExecuteOptions {
        ExecuteOptions {
            async_mode: true,
            priority: 0,
        }
    }

    fn linear() -> flowgate_types::workflow::Workflow {
        workflow(
            vec![
                node("t", NodeKind::Trigger, Value::Null),
                node("end", NodeKind::End, Value::Null),
            ],
            vec![edge("t", "end")],
        )
    }

    #[tokio::test]
    async fn run_once_drives_queued_execution() {
        let (_, engine) = engine();
        let engine = Arc::new(engine);
        let wf = engine.create_workflow(linear()).await.unwrap();
        let response = engine
            .execute(wf.id, "test", json!({"n": 1}), async_opts())
            .await
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::Queued);

        let pool = WorkerPool::new(engine.clone(), WorkerConfig::default());
        let outcome = pool.run_once("w").await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Processed(ExecutionStatus::Completed)));
        assert_eq!(pool.run_once("w").await.unwrap(), None);

        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let job = engine.queue().get(&execution.job_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn job_for_missing_execution_is_abandoned() {
        let (_, engine) = engine();
        let engine = Arc::new(engine);
        let job = engine.queue().enqueue(NewJob::start(Uuid::now_v7(), 0)).await.unwrap();

        let pool = WorkerPool::new(engine.clone(), WorkerConfig::default());
        let outcome = pool.run_once("w").await.unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Abandoned(_))));
        assert_eq!(pool.stats().abandoned.load(Ordering::Relaxed), 1);

        let job = engine.queue().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn abandoned_start_job_errors_its_queued_execution() {
        let (_, engine) = engine();
        let wf = engine.create_workflow(linear()).await.unwrap();
        let response = engine.execute(wf.id, "test", json!({}), async_opts()).await.unwrap();
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        let job = engine.queue().get(&execution.job_id.unwrap()).await.unwrap().unwrap();

        assert!(engine.abandon_job(&job, "gave up").await.unwrap());
        assert!(!engine.abandon_job(&job, "gave up").await.unwrap());
        let execution = engine.get_execution(response.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert_eq!(execution.error.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn spawned_pool_drains_queue_and_stops() {
        let (_, engine) = engine();
        let engine = Arc::new(engine);
        let wf = engine.create_workflow(linear()).await.unwrap();
        let mut ids = Vec::new();
        for n in 0..5 {
            let response = engine.execute(wf.id, "test", json!({"n": n}), async_opts()).await.unwrap();
            ids.push(response.execution_id);
        }

        let config = WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let pool = WorkerPool::new(engine.clone(), config);
        let stats = pool.stats();
        let (handle, shutdown) = spawn_worker_pool(pool);

        for _ in 0..200 {
            if stats.processed.load(Ordering::Relaxed) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.send(true).unwrap();
        handle.await.unwrap();

        for id in ids {
            let execution = engine.get_execution(id).await.unwrap();
            assert_eq!(execution.status, ExecutionStatus::Completed);
        }
        assert_eq!(stats.processed.load(Ordering::Relaxed), 5);
    }
}
