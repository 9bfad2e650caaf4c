//! Configuration types for Flowgate.
//!
//! `Settings` represents the top-level `config.toml`. Every section and field
//! has a default, so an empty file (or no file) is a valid configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite URL. Falls back to `<data_dir>/flowgate.db` when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub cleanup: CleanupSettings,

    #[serde(default)]
    pub sandbox: SandboxSettings,

    #[serde(default)]
    pub http: HttpSettings,

    /// Endpoint for `ai-agent` nodes. The node kind is unavailable when unset.
    #[serde(default)]
    pub agent: Option<AgentSettings>,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Whole-execution timeout for a single traversal.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,

    /// Default deadline for approval requests.
    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,

    /// Upper bound for `delay` nodes.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Continue approved executions through the job queue instead of inline.
    #[serde(default)]
    pub async_resume: bool,

    /// How often a running wave refreshes `last_progress_at`. Keep it well
    /// under `cleanup.zombie_threshold_secs`.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Capacity of the in-process event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_approval_ttl_secs() -> u64 {
    86_400
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workflow_timeout_secs: default_workflow_timeout_secs(),
            approval_ttl_secs: default_approval_ttl_secs(),
            max_delay_ms: default_max_delay_ms(),
            async_resume: false,
            heartbeat_secs: default_heartbeat_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle sleep between empty claims.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Claims older than this are handed to another worker.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cleanup worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,

    /// A running execution with no progress for this long is a zombie.
    #[serde(default = "default_zombie_threshold_secs")]
    pub zombie_threshold_secs: u64,

    /// Maximum repairs per category per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_zombie_threshold_secs() -> u64 {
    300
}

fn default_batch_size() -> u32 {
    100
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval_secs(),
            zombie_threshold_secs: default_zombie_threshold_secs(),
            batch_size: default_batch_size(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Defaults applied to `code` nodes that do not set their own limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_sandbox_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_sandbox_memory_mb")]
    pub default_memory_limit_mb: u64,
}

fn default_sandbox_timeout_ms() -> u64 {
    1_000
}

fn default_sandbox_memory_mb() -> u64 {
    64
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_sandbox_timeout_ms(),
            default_memory_limit_mb: default_sandbox_memory_mb(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "flowgate/0.1".to_string()
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// OpenAI-compatible chat completions endpoint used by `ai-agent` nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

// ---------------------------------------------------------------------------
// Logging / server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            otel: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
