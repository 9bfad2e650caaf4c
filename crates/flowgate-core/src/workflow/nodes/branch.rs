//! The `condition` node: evaluates one or more comparisons and reports a
//! boolean that selects the `true` or `false` outgoing handle.

use flowgate_types::workflow::{Condition, ConditionOperator, Node};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::workflow::condition::evaluate;
use crate::workflow::context::NodeScope;
use crate::workflow::registry::{NodeExecutor, NodeResult, parse_config};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Combinator {
    #[default]
    And,
    Or,
}

/// Either a single inline comparison or a list joined by `combinator`.
#[derive(Debug, Deserialize)]
struct ConditionConfig {
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    operator: Option<ConditionOperator>,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    combinator: Combinator,
}

impl ConditionConfig {
    fn into_conditions(self) -> Result<(Vec<Condition>, Combinator), String> {
        let mut conditions = self.conditions;
        if let Some(field) = self.field {
            let operator = self
                .operator
                .ok_or_else(|| format!("condition on '{field}' has no operator"))?;
            conditions.insert(0, Condition::new(field, operator, self.value));
        }
        if conditions.is_empty() {
            return Err("condition node has no conditions".to_string());
        }
        Ok((conditions, self.combinator))
    }
}

pub struct ConditionExecutor;

impl NodeExecutor for ConditionExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: ConditionConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            let (conditions, combinator) = match config.into_conditions() {
                Ok(parts) => parts,
                Err(e) => return NodeResult::fail(e),
            };
            let view = ctx.view();
            let result = match combinator {
                Combinator::And => conditions.iter().all(|c| evaluate(c, &view)),
                Combinator::Or => conditions.iter().any(|c| evaluate(c, &view)),
            };
            tracing::debug!(node_id = %node.id, result, "condition evaluated");
            NodeResult::ok(json!({ "result": result }))
        })
    }
}
