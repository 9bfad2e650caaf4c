//! Contracts for running untrusted script snippets.
//!
//! The sandbox itself lives in `flowgate-infra`; these types are shared with
//! the `code` node executor in `flowgate-core`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard ceiling on a single sandbox call's wall-clock budget.
pub const MAX_TIMEOUT_MS: u64 = 5_000;

/// Hard ceiling on a single sandbox call's memory budget.
pub const MAX_MEMORY_LIMIT_MB: u64 = 256;

/// How a script maps over its input items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One value per item (or one value when there are no items).
    #[default]
    Expression,
    /// One item in, one or many out. Returning an array flattens.
    Transform,
    /// Keep items for which the script is truthy.
    Filter,
    /// All items in, one value out.
    Aggregate,
    /// All items in, any number out.
    #[serde(alias = "runOnce")]
    RunOnce,
}

impl ExecutionMode {
    /// Whether the script is evaluated once per item.
    pub fn is_per_item(self) -> bool {
        matches!(self, Self::Expression | Self::Transform | Self::Filter)
    }
}

/// Resource budget for one sandbox call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
}

impl SandboxLimits {
    /// Clamp both limits into `1..=ceiling`.
    pub fn clamped(self) -> Self {
        Self {
            timeout_ms: self.timeout_ms.clamp(1, MAX_TIMEOUT_MS),
            memory_limit_mb: self.memory_limit_mb.clamp(1, MAX_MEMORY_LIMIT_MB),
        }
    }

    pub fn memory_limit_bytes(self) -> usize {
        (self.memory_limit_mb as usize).saturating_mul(1024 * 1024)
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            memory_limit_mb: 64,
        }
    }
}

/// A single sandbox invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub code: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Items the script maps over.
    #[serde(default)]
    pub items: Vec<Value>,
    /// Read-only globals exposed to the script (`input`, `vars`, `nodes`).
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub limits: SandboxLimits,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl SandboxRequest {
    pub fn new(code: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            code: code.into(),
            mode,
            items: Vec::new(),
            context: Value::Null,
            limits: SandboxLimits::default(),
            continue_on_error: false,
        }
    }

    pub fn with_items(mut self, items: Vec<Value>) -> Self {
        self.items = items;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn continue_on_error(mut self, yes: bool) -> Self {
        self.continue_on_error = yes;
        self
    }
}

/// Why a sandbox call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxFailureReason {
    Syntax,
    Runtime,
    Timeout,
    MemoryLimit,
    /// The sandbox thread itself died.
    Crash,
    /// The script returned something that cannot be represented as JSON or
    /// does not fit the mode.
    InvalidOutput,
}

impl SandboxFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Runtime => "runtime",
            Self::Timeout => "timeout",
            Self::MemoryLimit => "memory_limit",
            Self::Crash => "crash",
            Self::InvalidOutput => "invalid_output",
        }
    }
}

impl fmt::Display for SandboxFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error shape surfaced for every sandbox failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("code execution failed ({reason}): {message}")]
pub struct CodeExecutionError {
    pub reason: SandboxFailureReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
}

impl CodeExecutionError {
    pub fn new(reason: SandboxFailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            item_index: None,
        }
    }

    pub fn at_item(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }
}

/// Outcome of a sandbox call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CodeExecutionError>,
    /// Captured `print` / `debug` output.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Per-item failures tolerated under `continue_on_error`.
    #[serde(default)]
    pub item_errors: Vec<CodeExecutionError>,
    pub duration_ms: u64,
}

impl SandboxResult {
    pub fn ok(data: Value, logs: Vec<String>, item_errors: Vec<CodeExecutionError>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            logs,
            item_errors,
            duration_ms: 0,
        }
    }

    pub fn err(error: CodeExecutionError, logs: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            logs,
            item_errors: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
