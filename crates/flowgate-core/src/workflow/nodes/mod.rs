//! Built-in node executors.
//!
//! Executors that need the outside world (HTTP, the script sandbox, model
//! endpoints) receive it through the traits defined next to them; the
//! infrastructure crate supplies the implementations.

pub mod agent;
pub mod approval;
pub mod basic;
pub mod branch;
pub mod code;
pub mod http;

use std::sync::Arc;

use flowgate_types::sandbox::SandboxLimits;
use flowgate_types::workflow::NodeKind;

use super::budget::{AllowAllBudget, BudgetGuard};
use super::registry::NodeExecutorRegistry;

pub use agent::{AgentInvoker, AgentRequest, AgentResponse};
pub use code::ScriptSandbox;
pub use http::{HttpClient, HttpRequest, HttpResponse};

/// Tunables shared by the built-in executors.
#[derive(Debug, Clone, Copy)]
pub struct NodeSettings {
    pub max_delay_ms: u64,
    pub sandbox_defaults: SandboxLimits,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            max_delay_ms: 300_000,
            sandbox_defaults: SandboxLimits::default(),
        }
    }
}

/// Outbound collaborators for the built-in executors. Executors whose
/// collaborator is missing are not registered.
#[derive(Clone, Default)]
pub struct BuiltinServices {
    pub http: Option<Arc<dyn HttpClient>>,
    pub sandbox: Option<Arc<dyn ScriptSandbox>>,
    pub agent: Option<Arc<dyn AgentInvoker>>,
    pub budget: Option<Arc<dyn BudgetGuard>>,
    pub settings: NodeSettings,
}

/// Build a registry with every built-in executor whose dependencies are
/// available.
pub fn builtin_registry(services: BuiltinServices) -> NodeExecutorRegistry {
    let mut registry = NodeExecutorRegistry::new();
    registry
        .register(NodeKind::Trigger, Arc::new(basic::TriggerExecutor))
        .register(NodeKind::Transform, Arc::new(basic::TransformExecutor))
        .register(NodeKind::SetVariable, Arc::new(basic::SetVariableExecutor))
        .register(NodeKind::Log, Arc::new(basic::LogExecutor))
        .register(NodeKind::End, Arc::new(basic::EndExecutor))
        .register(
            NodeKind::Delay,
            Arc::new(basic::DelayExecutor::new(services.settings.max_delay_ms)),
        )
        .register(NodeKind::Condition, Arc::new(branch::ConditionExecutor))
        .register(NodeKind::HumanApproval, Arc::new(approval::HumanApprovalExecutor));

    if let Some(http) = services.http {
        registry.register(NodeKind::Http, Arc::new(http::HttpExecutor::new(http)));
    }
    if let Some(sandbox) = services.sandbox {
        registry.register(
            NodeKind::Code,
            Arc::new(code::CodeExecutor::new(sandbox, services.settings.sandbox_defaults)),
        );
    }
    if let Some(agent) = services.agent {
        let budget = services
            .budget
            .unwrap_or_else(|| Arc::new(AllowAllBudget) as Arc<dyn BudgetGuard>);
        registry.register(
            NodeKind::AiAgent,
            Arc::new(agent::AgentExecutor::new(agent, budget)),
        );
    }

    registry
}
