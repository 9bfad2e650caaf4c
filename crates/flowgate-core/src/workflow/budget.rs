//! Spend control for runs and model calls.
//!
//! The engine asks the guard once before a fresh run starts, and the
//! `ai-agent` executor asks again before every model call and reports the
//! tokens it spent afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use uuid::Uuid;

pub trait BudgetGuard: Send + Sync {
    /// `Err` carries the reason the run (or call) is refused.
    fn check_run<'a>(&'a self, workflow_id: Uuid, execution_id: Uuid) -> BoxFuture<'a, Result<(), String>>;

    fn record_usage<'a>(&'a self, workflow_id: Uuid, execution_id: Uuid, tokens: u64) -> BoxFuture<'a, ()>;
}

/// Never refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllBudget;

impl BudgetGuard for AllowAllBudget {
    fn check_run<'a>(&'a self, _workflow_id: Uuid, _execution_id: Uuid) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async { Ok(()) })
    }

    fn record_usage<'a>(&'a self, _workflow_id: Uuid, _execution_id: Uuid, _tokens: u64) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Process-wide token cap shared by every run.
///
/// Usage is counted with a lock-free `fetch_add`. Once usage reaches the
/// limit every check is refused. A warning is logged exactly once when usage
/// first crosses 80% of the limit, even under concurrent recording.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    limit: u64,
    used: Arc<AtomicU64>,
    warned: Arc<AtomicBool>,
}

impl TokenBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicU64::new(0)),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }
}

impl BudgetGuard for TokenBudget {
    fn check_run<'a>(&'a self, _workflow_id: Uuid, _execution_id: Uuid) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let used = self.used();
            if used >= self.limit {
                Err(format!("token budget exhausted ({used}/{})", self.limit))
            } else {
                Ok(())
            }
        })
    }

    fn record_usage<'a>(&'a self, workflow_id: Uuid, execution_id: Uuid, tokens: u64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let prev = self.used.fetch_add(tokens, Ordering::SeqCst);
            let total = prev.saturating_add(tokens);
            let threshold = self.limit * 80 / 100;
            if prev < threshold
                && total >= threshold
                && self
                    .warned
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    execution_id = %execution_id,
                    total,
                    limit = self.limit,
                    "token budget 80% consumed"
                );
            }
        })
    }
}
