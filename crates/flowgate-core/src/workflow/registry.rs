//! Node executor registry: the dispatch table from `NodeKind` to executor.
//!
//! Dispatch is a plain lookup keyed by the closed `NodeKind` enum. A kind
//! with nothing registered is reported as `UnknownNodeType`, never skipped.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use flowgate_types::workflow::{Node, NodeKind};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use super::context::NodeScope;
use super::error::EngineError;

// ---------------------------------------------------------------------------
// NodeResult
// ---------------------------------------------------------------------------

/// A request to park the run at an approval gate.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendRequest {
    pub title: String,
    pub description: Option<String>,
    /// Overrides the engine's default approval deadline.
    pub timeout_secs: Option<u64>,
}

/// What an executor reports for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Lines to attach to the execution log.
    pub logs: Vec<String>,
    pub suspend: Option<SuspendRequest>,
}

impl NodeResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            logs: Vec::new(),
            suspend: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            logs: Vec::new(),
            suspend: None,
        }
    }

    pub fn suspend(request: SuspendRequest) -> Self {
        Self {
            success: true,
            output: None,
            error: None,
            logs: Vec::new(),
            suspend: Some(request),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }
}

// ---------------------------------------------------------------------------
// NodeExecutor
// ---------------------------------------------------------------------------

/// A handler for one node kind.
///
/// Executors receive the node and a read-only `NodeScope` (the run context
/// plus this node's input) and return a `NodeResult`. They never mutate
/// the context; the engine applies results.
/// Boxed futures keep the trait object-safe so the registry can hold
/// heterogeneous executors.
pub trait NodeExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a NodeScope<'a>,
    ) -> BoxFuture<'a, NodeResult>;
}

/// Parse an executor's typed config out of `node.config`.
///
/// A `null` config is treated as `{}` so executors with all-default configs
/// accept nodes that omit it.
pub fn parse_config<T: serde::de::DeserializeOwned>(node: &Node) -> Result<T, String> {
    let raw = match &node.config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(raw)
        .map_err(|e| format!("invalid config for {} node '{}': {e}", node.node_type, node.id))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct NodeExecutorRegistry {
    handlers: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl NodeExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for a kind.
    pub fn register(&mut self, kind: NodeKind, executor: Arc<dyn NodeExecutor>) -> &mut Self {
        self.handlers.insert(kind, executor);
        self
    }

    pub fn contains(&self, kind: NodeKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn get(&self, kind: NodeKind) -> Result<&Arc<dyn NodeExecutor>, EngineError> {
        self.handlers
            .get(&kind)
            .ok_or_else(|| EngineError::UnknownNodeType(kind.to_string()))
    }

    /// Run the executor for `kind`, converting panics into a failed result.
    ///
    /// Only a missing executor is an `Err`; every handler-side problem comes
    /// back as `NodeResult { success: false, .. }`.
    pub async fn dispatch(
        &self,
        kind: NodeKind,
        node: &Node,
        ctx: &NodeScope<'_>,
    ) -> Result<NodeResult, EngineError> {
        let executor = self.get(kind)?;
        match AssertUnwindSafe(executor.execute(node, ctx)).catch_unwind().await {
            Ok(result) => Ok(result),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "executor panicked".to_string());
                tracing::error!(node_id = %node.id, kind = %kind, panic = %message, "node executor panicked");
                Ok(NodeResult::fail(format!("executor panicked: {message}")))
            }
        }
    }
}

impl std::fmt::Debug for NodeExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
