//! Pure built-ins: trigger, transform, set-variable, log, end and delay.

use std::time::Duration;

use flowgate_types::workflow::Node;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::workflow::context::NodeScope;
use crate::workflow::interpolate::{interpolate_value, render};
use crate::workflow::registry::{NodeExecutor, NodeResult, parse_config};

/// Passes the execution input through unchanged.
pub struct TriggerExecutor;

impl NodeExecutor for TriggerExecutor {
    fn execute<'a>(&'a self, _node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move { NodeResult::ok(ctx.input.clone()) })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct TransformConfig {
    #[serde(default)]
    template: Option<Value>,
}

/// Renders `config.template` against the context. Without a template the
/// node input is passed through.
pub struct TransformExecutor;

impl NodeExecutor for TransformExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: TransformConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            match config.template {
                Some(template) => NodeResult::ok(interpolate_value(&template, &ctx.view())),
                None => NodeResult::ok(ctx.node_input.clone()),
            }
        })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct SetVariableConfig {
    #[serde(default)]
    variables: Map<String, Value>,
}

/// Assigns variables. The output is the map of assigned values; the engine
/// merges it into the context, so replaying the output restores the
/// assignment.
pub struct SetVariableExecutor;

impl NodeExecutor for SetVariableExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: SetVariableConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            let view = ctx.view();
            let assigned: Map<String, Value> = config
                .variables
                .iter()
                .map(|(name, value)| (name.clone(), interpolate_value(value, &view)))
                .collect();
            NodeResult::ok(Value::Object(assigned))
        })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogConfig {
    #[serde(default)]
    message: String,
    #[serde(default = "default_level")]
    level: String,
}

fn default_level() -> String {
    "info".to_string()
}

/// Sink node: renders a message into tracing and the execution log.
pub struct LogExecutor;

impl NodeExecutor for LogExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: LogConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            let message = render(&config.message, &ctx.view());
            match config.level.as_str() {
                "error" => tracing::error!(execution_id = %ctx.execution_id, node_id = %node.id, "{message}"),
                "warn" | "warning" => tracing::warn!(execution_id = %ctx.execution_id, node_id = %node.id, "{message}"),
                "debug" => tracing::debug!(execution_id = %ctx.execution_id, node_id = %node.id, "{message}"),
                _ => tracing::info!(execution_id = %ctx.execution_id, node_id = %node.id, "{message}"),
            }
            NodeResult::ok(json!({"message": message, "level": config.level}))
                .with_logs(vec![message])
        })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct EndConfig {
    #[serde(default)]
    output: Option<Value>,
}

/// Terminal node. Its output becomes the execution output.
pub struct EndExecutor;

impl NodeExecutor for EndExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: EndConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            match config.output {
                Some(output) => NodeResult::ok(interpolate_value(&output, &ctx.view())),
                None => NodeResult::ok(ctx.node_input.clone()),
            }
        })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct DelayConfig {
    #[serde(default)]
    ms: u64,
}

/// Sleeps for `config.ms` (capped) and passes the node input through.
pub struct DelayExecutor {
    max_delay_ms: u64,
}

impl DelayExecutor {
    pub fn new(max_delay_ms: u64) -> Self {
        Self { max_delay_ms }
    }
}

impl NodeExecutor for DelayExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: DelayConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            let ms = if config.ms > self.max_delay_ms {
                tracing::warn!(
                    node_id = %node.id,
                    requested_ms = config.ms,
                    max_ms = self.max_delay_ms,
                    "delay capped"
                );
                self.max_delay_ms
            } else {
                config.ms
            };
            tokio::time::sleep(Duration::from_millis(ms)).await;
            NodeResult::ok(ctx.node_input.clone())
        })
    }
}
