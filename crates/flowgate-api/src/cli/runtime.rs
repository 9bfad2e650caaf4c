//! Long-running modes: `serve`, `worker` and `cleanup`.

use std::net::SocketAddr;

use anyhow::Result;
use console::style;
use flowgate_core::event::bus::Subscription;
use flowgate_core::workflow::cleanup::{CleanupConfig, CleanupWorker, spawn_cleanup_worker};
use flowgate_core::workflow::worker::{WorkerConfig, WorkerPool, spawn_worker_pool};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::http;
use crate::state::AppState;

/// Background tasks started alongside (or instead of) the HTTP server.
struct Background {
    tasks: Vec<(JoinHandle<()>, watch::Sender<bool>)>,
    events: JoinHandle<()>,
}

impl Background {
    fn start(state: &AppState, workers: Option<usize>) -> Self {
        let mut tasks = Vec::new();

        if let Some(concurrency) = workers {
            let mut config = WorkerConfig::from(&state.settings.worker);
            config.concurrency = concurrency.max(1);
            tasks.push(spawn_worker_pool(WorkerPool::new(state.engine.clone(), config)));
        }
        if state.settings.cleanup.enabled {
            tasks.push(spawn_cleanup_worker(cleanup_worker(state)));
        } else {
            tracing::info!("cleanup worker disabled by configuration");
        }

        let events = tokio::spawn(log_events(state.engine.event_bus().subscribe()));
        Self { tasks, events }
    }

    async fn stop(self) {
        for (_, shutdown_tx) in &self.tasks {
            let _ = shutdown_tx.send(true);
        }
        for (handle, _) in self.tasks {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        self.events.abort();
    }
}

fn cleanup_worker(state: &AppState) -> CleanupWorker<flowgate_infra::sqlite::SqliteWorkflowRepository> {
    CleanupWorker::new(
        state.engine.repository().clone(),
        CleanupConfig::from(&state.settings.cleanup),
    )
    .with_event_bus(state.engine.event_bus().clone())
}

/// Mirror lifecycle events into the log.
async fn log_events(mut events: Subscription) {
    while let Some(event) = events.recv().await {
        tracing::debug!(
            topic = event.topic(),
            execution_id = %event.execution_id(),
            "workflow event"
        );
    }
    tracing::debug!(missed = events.missed(), "event log stopped");
}

/// `flowgate serve`
pub async fn serve(state: AppState, host: Option<String>, port: Option<u16>, workers: bool) -> Result<()> {
    let host = host.unwrap_or_else(|| state.settings.server.host.clone());
    let port = port.unwrap_or(state.settings.server.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let concurrency = workers.then_some(state.settings.worker.concurrency);
    let background = Background::start(&state, concurrency);

    println!(
        "  {} Flowgate API listening on {}",
        style("*").green().bold(),
        style(format!("http://{addr}")).cyan()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state.clone());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    background.stop().await;
    state.db_pool.close().await;
    served?;
    println!("\n  Server stopped.");
    Ok(())
}

/// `flowgate worker`
pub async fn worker(state: AppState, concurrency: Option<usize>) -> Result<()> {
    let concurrency = concurrency.unwrap_or(state.settings.worker.concurrency);
    let background = Background::start(&state, Some(concurrency));
    println!(
        "  {} Flowgate worker running with {} workers",
        style("*").green().bold(),
        concurrency.max(1)
    );

    shutdown_signal().await;
    background.stop().await;
    state.db_pool.close().await;
    Ok(())
}

/// `flowgate cleanup [--once]`
pub async fn cleanup(state: AppState, once: bool, json: bool) -> Result<()> {
    let worker = cleanup_worker(&state);

    if once {
        let report = worker.run_cycle().await;
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "zombies_reaped": report.zombies_reaped,
                    "approvals_expired": report.approvals_expired,
                    "orphans_repaired": report.orphans_repaired,
                    "failures": report.failures,
                })
            );
        } else {
            println!(
                "  {} Cleanup: {} zombies reaped, {} approvals expired, {} orphans repaired, {} failures",
                style("*").green().bold(),
                report.zombies_reaped,
                report.approvals_expired,
                report.orphans_repaired,
                report.failures
            );
        }
        return Ok(());
    }

    let (handle, shutdown_tx) = spawn_cleanup_worker(worker);
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}
