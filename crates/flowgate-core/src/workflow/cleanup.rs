//! Background cleanup worker.
//!
//! Every cycle repairs three kinds of stuck state, each in a bounded batch:
//! zombie runs (running without progress), approvals past their deadline,
//! and orphaned waiting runs with no pending approval. Every repair is a
//! conditional update, so concurrent cycles (or several processes) never
//! repair or log the same execution twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flowgate_types::config::CleanupSettings;
use flowgate_types::event::WorkflowEvent;
use tokio::sync::watch;
use tracing::{debug, error, info};
use crate::event::bus::EventBus;
use crate::repository::workflow::{Repair, WorkflowRepository};

use super::error::EngineError;

pub const ACTION_ZOMBIE_REAPED: &str = "zombie_reaped";
pub const ACTION_APPROVAL_EXPIRED: &str = "approval_expired";
pub const ACTION_ORPHAN_REPAIRED: &str = "orphan_repaired";

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often to run a cycle.
    pub interval: Duration,
    /// A running execution with no progress for this long is a zombie.
    pub zombie_threshold: Duration,
    /// Maximum rows handled per category per cycle.
    pub batch_size: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            zombie_threshold: Duration::from_secs(300),
            batch_size: 100,
        }
    }
}

impl From<&CleanupSettings> for CleanupConfig {
    fn from(settings: &CleanupSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            zombie_threshold: Duration::from_secs(settings.zombie_threshold_secs),
            batch_size: settings.batch_size.max(1),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub zombies_reaped: u64,
    pub approvals_expired: u64,
    pub orphans_repaired: u64,
    pub failures: u64,
}

impl CycleReport {
    pub fn repaired(&self) -> u64 {
        self.zombies_reaped + self.approvals_expired + self.orphans_repaired
    }
}

/// Cumulative counters for observability.
#[derive(Debug, Default)]
pub struct CleanupStats {
    cycles: AtomicU64,
    zombies_reaped: AtomicU64,
    approvals_expired: AtomicU64,
    orphans_repaired: AtomicU64,
    failures: AtomicU64,
    total_cycle_ms: AtomicU64,
}

/// Point-in-time copy of `CleanupStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CleanupSnapshot {
    pub cycles: u64,
    pub zombies_reaped: u64,
    pub approvals_expired: u64,
    pub orphans_repaired: u64,
    pub failures: u64,
    pub avg_cycle_ms: f64,
}

impl CleanupStats {
    fn record(&self, report: &CycleReport, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.zombies_reaped.fetch_add(report.zombies_reaped, Ordering::Relaxed);
        self.approvals_expired.fetch_add(report.approvals_expired, Ordering::Relaxed);
        self.orphans_repaired.fetch_add(report.orphans_repaired, Ordering::Relaxed);
        self.failures.fetch_add(report.failures, Ordering::Relaxed);
        self.total_cycle_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CleanupSnapshot {
        let cycles = self.cycles.load(Ordering::Relaxed);
        let total = self.total_cycle_ms.load(Ordering::Relaxed);
        CleanupSnapshot {
            cycles,
            zombies_reaped: self.zombies_reaped.load(Ordering::Relaxed),
            approvals_expired: self.approvals_expired.load(Ordering::Relaxed),
            orphans_repaired: self.orphans_repaired.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_cycle_ms: if cycles == 0 { 0.0 } else { total as f64 / cycles as f64 },
        }
    }
}

pub struct CleanupWorker<R: WorkflowRepository> {
    repo: Arc<R>,
    config: CleanupConfig,
    stats: Arc<CleanupStats>,
    event_bus: Option<EventBus>,
}

impl<R: WorkflowRepository + 'static> CleanupWorker<R> {
    pub fn new(repo: Arc<R>, config: CleanupConfig) -> Self {
        Self {
            repo,
            config,
            stats: Arc::new(CleanupStats::default()),
            event_bus: None,
        }
    }

    /// Publish `ExecutionFailed` for every execution this worker repairs.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn stats(&self) -> Arc<CleanupStats> {
        self.stats.clone()
    }

    /// Run one cycle against the current clock.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as if the clock read `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        self.reap_zombies(now, &mut report).await;
        self.expire_approvals(now, &mut report).await;
        self.repair_orphans(now, &mut report).await;

        let elapsed = started.elapsed();
        self.stats.record(&report, elapsed);
        if report.repaired() > 0 || report.failures > 0 {
            info!(
                zombies_reaped = report.zombies_reaped,
                approvals_expired = report.approvals_expired,
                orphans_repaired = report.orphans_repaired,
                failures = report.failures,
                elapsed_ms = elapsed.as_millis() as u64,
                "cleanup cycle finished"
            );
        } else {
            debug!(elapsed_ms = elapsed.as_millis() as u64, "cleanup cycle found nothing to repair");
        }
        report
    }

    async fn reap_zombies(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let threshold = chrono::Duration::from_std(self.config.zombie_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let cutoff = now - threshold;
        let candidates = match self.repo.list_zombie_candidates(cutoff, self.config.batch_size).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "failed to list zombie executions");
                report.failures += 1;
                return;
            }
        };

        for execution_id in candidates {
            let diagnostic = EngineError::ZombieTerminated {
                execution_id,
                threshold_secs: self.config.zombie_threshold.as_secs(),
            }
            .to_string();
            let repair = Repair {
                execution_id,
                action: ACTION_ZOMBIE_REAPED,
                diagnostic,
                now,
            };
            match self.repo.reap_zombie(&repair, cutoff).await {
                Ok(true) => {
                    report.zombies_reaped += 1;
                    self.announce(&repair).await;
                    info!(execution_id = %execution_id, "zombie execution reaped");
                }
                Ok(false) => debug!(execution_id = %execution_id, "zombie already handled"),
                Err(e) => {
                    error!(error = %e, execution_id = %execution_id, "failed to reap zombie execution");
                    report.failures += 1;
                }
            }
        }
    }

    async fn expire_approvals(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let expired = match self.repo.list_expired_approvals(now, self.config.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to list expired approvals");
                report.failures += 1;
                return;
            }
        };

        for approval in expired {
            let repair = Repair {
                execution_id: approval.execution_id,
                action: ACTION_APPROVAL_EXPIRED,
                diagnostic: EngineError::ApprovalExpired {
                    approval_id: approval.id,
                }
                .to_string(),
                now,
            };
            match self.repo.expire_approval(&approval.id, &repair).await {
                Ok(true) => {
                    report.approvals_expired += 1;
                    self.announce(&repair).await;
                    info!(
                        approval_id = %approval.id,
                        execution_id = %approval.execution_id,
                        "approval expired"
                    );
                }
                Ok(false) => debug!(approval_id = %approval.id, "approval already resolved"),
                Err(e) => {
                    error!(error = %e, approval_id = %approval.id, "failed to expire approval");
                    report.failures += 1;
                }
            }
        }
    }

    async fn repair_orphans(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let orphans = match self.repo.list_orphaned_executions(self.config.batch_size).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "failed to list orphaned executions");
                report.failures += 1;
                return;
            }
        };

        for execution_id in orphans {
            let repair = Repair {
                execution_id,
                action: ACTION_ORPHAN_REPAIRED,
                diagnostic: EngineError::Orphaned(execution_id).to_string(),
                now,
            };
            match self.repo.repair_orphan(&repair).await {
                Ok(true) => {
                    report.orphans_repaired += 1;
                    self.announce(&repair).await;
                    info!(execution_id = %execution_id, "orphaned execution repaired");
                }
                Ok(false) => debug!(execution_id = %execution_id, "orphan already handled"),
                Err(e) => {
                    error!(error = %e, execution_id = %execution_id, "failed to repair orphaned execution");
                    report.failures += 1;
                }
            }
        }
    }

    async fn announce(&self, repair: &Repair) {
        let Some(bus) = &self.event_bus else {
            return;
        };
        match self.repo.get_execution(&repair.execution_id).await {
            Ok(Some(execution)) => {
                bus.publish(WorkflowEvent::ExecutionFailed {
                    execution_id: repair.execution_id,
                    workflow_id: execution.workflow_id,
                    error: repair.diagnostic.clone(),
                });
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, execution_id = %repair.execution_id, "skipping repair event"),
        }
    }

    /// Run cycles on the configured interval until shutdown is signalled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            zombie_threshold_secs = self.config.zombie_threshold.as_secs(),
            batch_size = self.config.batch_size,
            "cleanup worker started"
        );
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("cleanup worker shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    self.run_cycle().await;
                }
            }
        }
    }
}

/// Spawn a cleanup worker. Send `true` on the returned sender to stop it.
pub fn spawn_cleanup_worker<R: WorkflowRepository + 'static>(
    worker: CleanupWorker<R>,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    (handle, shutdown_tx)
}
