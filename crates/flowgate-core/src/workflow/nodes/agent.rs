//! The `ai-agent` node and the model invocation seam.

use std::sync::Arc;

use flowgate_types::workflow::Node;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::workflow::budget::BudgetGuard;
use crate::workflow::context::NodeScope;
use crate::workflow::interpolate::render;
use crate::workflow::registry::{NodeExecutor, NodeResult, parse_config};

// ---------------------------------------------------------------------------
// Invocation seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub total_tokens: u64,
}

pub trait AgentInvoker: Send + Sync {
    fn invoke<'a>(&'a self, request: AgentRequest) -> BoxFuture<'a, Result<AgentResponse, String>>;
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AgentConfig {
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
}

pub struct AgentExecutor {
    invoker: Arc<dyn AgentInvoker>,
    budget: Arc<dyn BudgetGuard>,
}

impl AgentExecutor {
    pub fn new(invoker: Arc<dyn AgentInvoker>, budget: Arc<dyn BudgetGuard>) -> Self {
        Self { invoker, budget }
    }
}

impl NodeExecutor for AgentExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: AgentConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            if let Err(reason) = self.budget.check_run(ctx.workflow_id, ctx.execution_id).await {
                tracing::warn!(execution_id = %ctx.execution_id, node_id = %node.id, %reason, "agent call refused by budget");
                return NodeResult::fail(format!("budget exceeded: {reason}"));
            }

            let view = ctx.view();
            let request = AgentRequest {
                prompt: render(&config.prompt, &view),
                system: config.system.map(|s| render(&s, &view)),
                model: config.model,
                temperature: config.temperature,
            };
            match self.invoker.invoke(request).await {
                Ok(response) => {
                    self.budget
                        .record_usage(ctx.workflow_id, ctx.execution_id, response.total_tokens)
                        .await;
                    NodeResult::ok(json!({
                        "response": response.content,
                        "model": response.model,
                        "usage": { "total_tokens": response.total_tokens },
                    }))
                }
                Err(e) => NodeResult::fail(format!("agent call failed: {e}")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::ExecutionContext;
    use crate::workflow::budget::TokenBudget;
    use flowgate_types::workflow::NodeKind;
    use uuid::Uuid;

    struct Canned;

    impl AgentInvoker for Canned {
        fn invoke<'a>(&'a self, request: AgentRequest) -> BoxFuture<'a, Result<AgentResponse, String>> {
            Box::pin(async move {
                Ok(AgentResponse {
                    content: format!("echo: {}", request.prompt),
                    model: request.model.unwrap_or_else(|| "test-model".into()),
                    total_tokens: 40,
                })
            })
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::seed(Uuid::now_v7(), Uuid::now_v7(), &[], serde_json::json!({"topic": "rust"}))
    }

    #[tokio::test]
    async fn renders_prompt_and_records_usage() {
        let budget = Arc::new(TokenBudget::new(100));
        let executor = AgentExecutor::new(Arc::new(Canned), budget.clone());
        let node = Node::new("a", NodeKind::AiAgent, json!({"prompt": "write about {{topic}}"}));

        let result = executor.execute(&node, &ctx().scope("a", serde_json::Value::Null)).await;
        let output = result.output.unwrap();
        assert_eq!(output["response"], json!("echo: write about rust"));
        assert_eq!(budget.used(), 40);
    }

    #[tokio::test]
    async fn exhausted_budget_refuses_call() {
        let budget = Arc::new(TokenBudget::new(50));
        let executor = AgentExecutor::new(Arc::new(Canned), budget.clone());
        let node = Node::new("a", NodeKind::AiAgent, json!({"prompt": "hi"}));

        assert!(executor.execute(&node, &ctx().scope("a", serde_json::Value::Null)).await.success);
        assert!(executor.execute(&node, &ctx().scope("a", serde_json::Value::Null)).await.success);
        let third = executor.execute(&node, &ctx().scope("a", serde_json::Value::Null)).await;
        assert!(!third.success);
        assert!(third.error.unwrap().contains("budget"));
    }
}
