//! The `code` node: runs a user script in the sandbox.

use std::sync::Arc;

use flowgate_types::sandbox::{ExecutionMode, SandboxLimits, SandboxRequest, SandboxResult};
use flowgate_types::workflow::Node;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::workflow::context::NodeScope;
use crate::workflow::interpolate::interpolate_value;
use crate::workflow::registry::{NodeExecutor, NodeResult, parse_config};

/// Isolated script runner. Every failure, including a crash of the runner
/// itself, is reported inside the `SandboxResult`.
pub trait ScriptSandbox: Send + Sync {
    fn execute<'a>(&'a self, request: SandboxRequest) -> BoxFuture<'a, SandboxResult>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeConfig {
    code: String,
    #[serde(default)]
    mode: ExecutionMode,
    /// Explicit items; defaults to the node input.
    #[serde(default)]
    items: Option<Value>,
    #[serde(default, alias = "continue_on_error")]
    continue_on_error: bool,
    #[serde(default, alias = "timeout_ms")]
    timeout_ms: Option<u64>,
    #[serde(default, alias = "memory_limit_mb")]
    memory_limit_mb: Option<u64>,
}

pub struct CodeExecutor {
    sandbox: Arc<dyn ScriptSandbox>,
    defaults: SandboxLimits,
}

impl CodeExecutor {
    pub fn new(sandbox: Arc<dyn ScriptSandbox>, defaults: SandboxLimits) -> Self {
        Self { sandbox, defaults }
    }
}

fn as_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

impl NodeExecutor for CodeExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: CodeConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };

            let items = match &config.items {
                Some(explicit) => as_items(interpolate_value(explicit, &ctx.view())),
                None => as_items(ctx.node_input.clone()),
            };
            let limits = SandboxLimits {
                timeout_ms: config.timeout_ms.unwrap_or(self.defaults.timeout_ms),
                memory_limit_mb: config.memory_limit_mb.unwrap_or(self.defaults.memory_limit_mb),
            }
            .clamped();

            let request = SandboxRequest::new(config.code, config.mode)
                .with_items(items)
                .with_context(ctx.sandbox_globals())
                .with_limits(limits)
                .continue_on_error(config.continue_on_error);

            let result = self.sandbox.execute(request).await;

            let mut logs = result.logs;
            logs.extend(result.item_errors.iter().map(|e| e.to_string()));

            if result.success {
                tracing::debug!(
                    node_id = %node.id,
                    duration_ms = result.duration_ms,
                    item_errors = result.item_errors.len(),
                    "script finished"
                );
                return NodeResult::ok(result.data.unwrap_or(Value::Null)).with_logs(logs);
            }

            match result.error {
                Some(error) => {
                    tracing::warn!(node_id = %node.id, reason = %error.reason, error = %error.message, "script failed");
                    NodeResult::fail(error.to_string())
                        .with_output(json!({ "error": error }))
                        .with_logs(logs)
                }
                None => NodeResult::fail("script failed without an error report").with_logs(logs),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::ExecutionContext;
    use flowgate_types::sandbox::{CodeExecutionError, SandboxFailureReason};
    use flowgate_types::workflow::NodeKind;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Echoes its items back, or fails when the code says so.
    struct EchoSandbox {
        seen: Mutex<Option<SandboxRequest>>,
    }

    impl ScriptSandbox for EchoSandbox {
        fn execute<'a>(&'a self, request: SandboxRequest) -> BoxFuture<'a, SandboxResult> {
            Box::pin(async move {
                let result = if request.code == "throw" {
                    SandboxResult::err(
                        CodeExecutionError::new(SandboxFailureReason::Runtime, "boom"),
                        vec!["before".into()],
                    )
                } else {
                    SandboxResult::ok(Value::Array(request.items.clone()), vec!["hi".into()], Vec::new())
                };
                *self.seen.lock().unwrap() = Some(request);
                result
            })
        }
    }

    fn executor() -> (Arc<EchoSandbox>, CodeExecutor) {
        let sandbox = Arc::new(EchoSandbox { seen: Mutex::new(None) });
        let executor = CodeExecutor::new(sandbox.clone(), SandboxLimits::default());
        (sandbox, executor)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::seed(Uuid::now_v7(), Uuid::now_v7(), &[], json!([1, 2, 3]))
    }

    #[tokio::test]
    async fn items_default_to_node_input_and_limits_clamp() {
        let (sandbox, executor) = executor();
        let node = Node::new("c", NodeKind::Code, json!({"code": "x", "timeoutMs": 99_999}));
        let result = executor.execute(&node, &ctx().scope("c", json!([1, 2, 3]))).await;
        assert!(result.success);
        assert_eq!(result.output, Some(json!([1, 2, 3])));
        assert_eq!(result.logs, vec!["hi".to_string()]);

        let seen = sandbox.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.limits.timeout_ms, flowgate_types::sandbox::MAX_TIMEOUT_MS);
        assert_eq!(seen.context["input"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn failure_carries_structured_error() {
        let (_, executor) = executor();
        let node = Node::new("c", NodeKind::Code, json!({"code": "throw"}));
        let result = executor.execute(&node, &ctx().scope("c", json!([1, 2, 3]))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("runtime"));
        assert_eq!(result.output.unwrap()["error"]["reason"], json!("runtime"));
        assert_eq!(result.logs, vec!["before".to_string()]);
    }
}
