//! Per-run execution context with node output tracking.
//!
//! `ExecutionContext` is the mutable state that flows through a run. It is
//! owned by exactly one traversal and is never persisted directly: it is
//! rebuilt from the workflow's variable defaults, the execution input and
//! the recorded node states (`replay_memo` feeding
//! `WorkflowEngine::continue_execution`).
//!
//! Executors never see the context itself. Each dispatch gets a
//! `NodeScope`: a read-only borrow of the context plus the node's own
//! input, taken from the upstream nodes whose edges into it fired.

use std::collections::BTreeMap;
use std::ops::Deref;

use flowgate_types::workflow::VariableDefinition;
use serde_json::{Map, Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single node output (1 MB).
pub const MAX_NODE_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Variables, input and node outputs for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub input: Value,
    pub variables: BTreeMap<String, Value>,
    /// Node outputs keyed by node id. Keys are always workflow node ids.
    pub node_outputs: BTreeMap<String, Value>,
}

impl ExecutionContext {
    /// Seed a context from declared variable defaults plus the run input.
    pub fn seed(
        execution_id: Uuid,
        workflow_id: Uuid,
        variables: &[VariableDefinition],
        input: Value,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            variables: variables
                .iter()
                .map(|v| (v.name.clone(), v.default.clone()))
                .collect(),
            node_outputs: BTreeMap::new(),
            input,
        }
    }

    /// Store the output of a completed node.
    ///
    /// Outputs above `MAX_NODE_OUTPUT_SIZE` are replaced by a truncation
    /// marker. Returns an error if the context as a whole grows past
    /// `MAX_CONTEXT_SIZE`.
    pub fn set_node_output(&mut self, node_id: &str, output: Value) -> Result<(), String> {
        let size = serialized_len(&output);
        let stored = if size > MAX_NODE_OUTPUT_SIZE {
            tracing::warn!(
                execution_id = %self.execution_id,
                node_id,
                size,
                max = MAX_NODE_OUTPUT_SIZE,
                "node output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!("output exceeded {MAX_NODE_OUTPUT_SIZE} byte limit and was truncated"),
            })
        } else {
            output
        };

        self.node_outputs.insert(node_id.to_string(), stored);

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(format!(
                "total context size ({total} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"
            ));
        }
        Ok(())
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    /// Input for a node fed by `sources`, the upstream nodes whose edges
    /// into it fired.
    ///
    /// The start node gets the run input, a single parent hands over its
    /// output, and a join gets an object keyed by parent node id.
    pub fn input_from<'s>(&self, sources: impl IntoIterator<Item = &'s str>) -> Value {
        let mut outputs: BTreeMap<&str, Value> = sources
            .into_iter()
            .map(|id| (id, self.node_outputs.get(id).cloned().unwrap_or(Value::Null)))
            .collect();
        match outputs.len() {
            0 => self.input.clone(),
            1 => outputs.pop_first().map(|(_, v)| v).unwrap_or(Value::Null),
            _ => Value::Object(
                outputs
                    .into_iter()
                    .map(|(id, v)| (id.to_string(), v))
                    .collect(),
            ),
        }
    }

    /// Borrow the context for one node dispatch.
    pub fn scope<'a>(&'a self, node_id: &'a str, node_input: Value) -> NodeScope<'a> {
        NodeScope {
            run: self,
            node_id,
            node_input,
        }
    }

    /// Merge assigned variables (from a `set-variable` node).
    pub fn assign_variables(&mut self, assigned: &Map<String, Value>) {
        for (name, value) in assigned {
            self.variables.insert(name.clone(), value.clone());
        }
    }

    /// The merged view that templates and conditions resolve against.
    ///
    /// Precedence, highest first: node outputs by node id, variables, the
    /// `input` key, then top-level fields of the input object.
    pub fn view(&self) -> Value {
        let mut merged = Map::new();
        if let Value::Object(fields) = &self.input {
            merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged.extend(self.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.insert("input".to_string(), self.input.clone());
        merged.extend(self.node_outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(merged)
    }

    /// Globals handed to the script sandbox.
    pub fn sandbox_globals(&self) -> Value {
        json!({
            "input": self.input,
            "vars": self.variables,
            "nodes": self.node_outputs,
            "execution_id": self.execution_id.to_string(),
        })
    }

    /// Compute the total serialized size of all context data in bytes.
    pub fn total_size(&self) -> usize {
        let outputs: usize = self.node_outputs.values().map(serialized_len).sum();
        let variables: usize = self.variables.values().map(serialized_len).sum();
        outputs + variables + serialized_len(&self.input)
    }
}

/// The view of a run that one executor call gets.
#[derive(Debug)]
pub struct NodeScope<'a> {
    run: &'a ExecutionContext,
    pub node_id: &'a str,
    /// Output of the upstream node(s) that led here. See
    /// `ExecutionContext::input_from`.
    pub node_input: Value,
}

impl Deref for NodeScope<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        self.run
    }
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}
