//! Application state wiring the engine to its SQLite stores and outbound
//! collaborators.
//!
//! Both the CLI and the REST handlers work through the same `AppState`.

use std::sync::Arc;

use flowgate_core::workflow::engine::WorkflowEngine;
use flowgate_core::workflow::nodes::{
    AgentInvoker, BuiltinServices, HttpClient, NodeSettings, ScriptSandbox, builtin_registry,
};
use flowgate_infra::config::resolve_database_url;
use flowgate_infra::http::{OpenAiCompatInvoker, ReqwestHttpClient};
use flowgate_infra::sandbox::RhaiSandbox;
use flowgate_infra::sqlite::{DatabasePool, SqliteJobQueue, SqliteWorkflowRepository};
use flowgate_types::config::Settings;
use flowgate_types::sandbox::SandboxLimits;

/// The engine pinned to the SQLite repository and queue.
pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository, SqliteJobQueue>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub settings: Arc<Settings>,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Connect to the configured database (running migrations) and wire the
    /// engine.
    pub async fn init(settings: Settings) -> anyhow::Result<Self> {
        let db_url = resolve_database_url(&settings);
        if let Some(path) = sqlite_file_path(&db_url) {
            if let Some(parent) = std::path::Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let db_pool = DatabasePool::new(&db_url).await?;
        Self::with_pool(settings, db_pool)
    }

    pub fn with_pool(settings: Settings, db_pool: DatabasePool) -> anyhow::Result<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(&settings.http)?);
        let sandbox: Arc<dyn ScriptSandbox> = Arc::new(RhaiSandbox::new());
        let agent = match &settings.agent {
            Some(agent) => {
                let invoker: Arc<dyn AgentInvoker> =
                    Arc::new(OpenAiCompatInvoker::new(agent, &settings.http)?);
                Some(invoker)
            }
            None => {
                tracing::debug!("no agent endpoint configured; ai-agent nodes are unavailable");
                None
            }
        };

        let registry = builtin_registry(BuiltinServices {
            http: Some(http),
            sandbox: Some(sandbox),
            agent,
            budget: None,
            settings: NodeSettings {
                max_delay_ms: settings.engine.max_delay_ms,
                sandbox_defaults: SandboxLimits {
                    timeout_ms: settings.sandbox.default_timeout_ms,
                    memory_limit_mb: settings.sandbox.default_memory_limit_mb,
                }
                .clamped(),
            },
        });

        let engine = WorkflowEngine::new(
            Arc::new(SqliteWorkflowRepository::new(db_pool.clone())),
            Arc::new(SqliteJobQueue::new(db_pool.clone())),
            Arc::new(registry),
            settings.engine.clone(),
        )
        .with_job_max_attempts(settings.worker.max_attempts);

        Ok(Self {
            engine: Arc::new(engine),
            settings: Arc::new(settings),
            db_pool,
        })
    }
}

/// The file behind a `sqlite://` URL, if it names one.
fn sqlite_file_path(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("sqlite://")?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty() && path != ":memory:").then_some(path)
}

#[cfg(test)]
pub(crate) async fn test_state() -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        database_url: Some(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("api.db").display()
        )),
        ..Default::default()
    };
    let state = AppState::init(settings).await.unwrap();
    (dir, state)
}
