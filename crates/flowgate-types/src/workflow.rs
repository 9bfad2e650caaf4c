//! Workflow graph types.
//!
//! A `Workflow` is a directed graph of `Node`s connected by `Edge`s. The graph
//! is stored as a JSON blob and is immutable once an execution references it;
//! edits bump `version`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A stored workflow definition plus its rolling execution metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Definition version, bumped on every edit.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Declared variables with their default values.
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    /// Opaque trigger configuration (webhook path, schedule, ...). The engine
    /// only stores it; trigger sources live outside the engine.
    #[serde(default, alias = "triggerConfig", skip_serializing_if = "Option::is_none")]
    pub trigger_config: Option<Value>,
    /// Rolling counters maintained by the storage layer.
    #[serde(default)]
    pub metrics: WorkflowMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    /// Create an empty draft workflow with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            version: 1,
            status: WorkflowStatus::Draft,
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
            trigger_config: None,
            metrics: WorkflowMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    /// Whether new executions may be started for a workflow in this status.
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Active | Self::Draft)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            other => Err(format!("invalid workflow status: {other}")),
        }
    }
}

/// Aggregate execution metrics for a workflow.
///
/// Only ever mutated by a single atomic statement in the storage layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub avg_duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// A declared workflow variable and its default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A unit of work in the workflow graph.
///
/// `node_type` is kept as the raw string so that definitions with unknown
/// types can be loaded and rejected with a precise validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Position,
    /// Executor-specific configuration object.
    #[serde(default)]
    pub config: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: kind.as_str().to_string(),
            name: None,
            position: Position::default(),
            config,
        }
    }

    /// Parse the node's type string.
    pub fn kind(&self) -> Option<NodeKind> {
        self.node_type.parse().ok()
    }

    /// Display label: the name if set, else the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Editor canvas position. Carried for round-tripping only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Every node kind the engine knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Trigger,
    Http,
    Transform,
    Condition,
    Delay,
    SetVariable,
    Log,
    End,
    Code,
    HumanApproval,
    AiAgent,
}

impl NodeKind {
    pub const ALL: [NodeKind; 11] = [
        Self::Trigger,
        Self::Http,
        Self::Transform,
        Self::Condition,
        Self::Delay,
        Self::SetVariable,
        Self::Log,
        Self::End,
        Self::Code,
        Self::HumanApproval,
        Self::AiAgent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Http => "http",
            Self::Transform => "transform",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::SetVariable => "set-variable",
            Self::Log => "log",
            Self::End => "end",
            Self::Code => "code",
            Self::HumanApproval => "human-approval",
            Self::AiAgent => "ai-agent",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown node type: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Named output port on the source node (e.g. `"true"` / `"false"` on a
    /// condition node).
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            condition: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// A single comparison: `field <operator> value`.
///
/// `field` is either a dotted path into the execution context or a string
/// containing `{{...}}` tokens. `value` is interpolated before comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// Comparison operators. Anything else deserializes to `Unsupported` and
/// always evaluates to false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Unsupported(String),
}

impl From<String> for ConditionOperator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "contains" => Self::Contains,
            ">" => Self::Gt,
            ">=" => Self::Gte,
            "<" => Self::Lt,
            "<=" => Self::Lte,
            "in" => Self::In,
            _ => Self::Unsupported(s),
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(op: ConditionOperator) -> Self {
        match op {
            ConditionOperator::Eq => "==".into(),
            ConditionOperator::Ne => "!=".into(),
            ConditionOperator::Contains => "contains".into(),
            ConditionOperator::Gt => ">".into(),
            ConditionOperator::Gte => ">=".into(),
            ConditionOperator::Lt => "<".into(),
            ConditionOperator::Lte => "<=".into(),
            ConditionOperator::In => "in".into(),
            ConditionOperator::Unsupported(s) => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_kind_round_trips_through_str() {
        for kind in NodeKind::ALL {
            assert_eq!(kind.as_str().parse::<NodeKind>().unwrap(), kind);
        }
        assert!("webhook-magic".parse::<NodeKind>().is_err());
    }

    #[test]
    fn node_kind_serde_matches_as_str() {
        let json = serde_json::to_string(&NodeKind::HumanApproval).unwrap();
        assert_eq!(json, "\"human-approval\"");
    }

    #[test]
    fn unknown_operator_deserializes_as_unsupported() {
        let cond: Condition =
            serde_json::from_value(json!({"field": "x", "operator": "~=", "value": 1})).unwrap();
        assert_eq!(cond.operator, ConditionOperator::Unsupported("~=".into()));

        let back = serde_json::to_value(&cond).unwrap();
        assert_eq!(back["operator"], "~=");
    }

    #[test]
    fn edge_accepts_camel_case_handle() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1", "source": "a", "target": "b", "sourceHandle": "true"
        }))
        .unwrap();
        assert_eq!(edge.source_handle.as_deref(), Some("true"));
    }

    #[test]
    fn workflow_deserializes_with_defaults() {
        let wf: Workflow = serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "minimal",
            "nodes": [{"id": "t", "type": "trigger"}],
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(wf.version, 1);
        assert_eq!(wf.status, WorkflowStatus::Draft);
        assert_eq!(wf.nodes[0].kind(), Some(NodeKind::Trigger));
        assert!(wf.edges.is_empty());
    }

    #[test]
    fn runnable_statuses() {
        assert!(WorkflowStatus::Draft.is_runnable());
        assert!(WorkflowStatus::Active.is_runnable());
        assert!(!WorkflowStatus::Paused.is_runnable());
        assert!(!WorkflowStatus::Archived.is_runnable());
    }
}
