//! Compiled workflow graph: validation, cycle detection and start resolution.
//!
//! `WorkflowGraph::build` turns a stored `Workflow` into an arena of nodes
//! indexed by position, with per-node outgoing and incoming edge lists. All
//! structural checks happen here so the engine can reject a bad definition
//! before it persists anything.
//!
//! Uses `petgraph` toposort to detect cycles. Loops are not supported: a
//! cycle is a load-time validation error.

use std::collections::{HashMap, VecDeque};

use flowgate_types::workflow::{Edge, Node, NodeKind, Workflow};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::error::ValidationError;

/// A node with its parsed kind.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub node: Node,
    pub kind: NodeKind,
}

/// Immutable, validated view of a workflow's graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
    /// Outgoing edge indices per node, in definition order.
    outgoing: Vec<Vec<usize>>,
    /// Incoming edge indices per node, counting only edges whose source is
    /// reachable from the start node.
    incoming: Vec<Vec<usize>>,
    reachable: Vec<bool>,
    start: usize,
}

impl WorkflowGraph {
    /// Validate and compile a workflow.
    pub fn build(workflow: &Workflow) -> Result<Self, ValidationError> {
        if workflow.nodes.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }

        let mut index = HashMap::with_capacity(workflow.nodes.len());
        let mut nodes = Vec::with_capacity(workflow.nodes.len());
        for (i, node) in workflow.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateNodeId(node.id.clone()));
            }
            let kind = node.kind().ok_or_else(|| ValidationError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            })?;
            nodes.push(GraphNode {
                node: node.clone(),
                kind,
            });
        }

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut endpoints = Vec::with_capacity(workflow.edges.len());
        for (e, edge) in workflow.edges.iter().enumerate() {
            let source = lookup(&index, edge, &edge.source)?;
            let target = lookup(&index, edge, &edge.target)?;
            outgoing[source].push(e);
            endpoints.push((source, target));
        }

        detect_cycle(&nodes, &endpoints)?;
        let start = resolve_start(&nodes, &endpoints)?;

        // Reachability from the start node.
        let mut reachable = vec![false; nodes.len()];
        let mut queue = VecDeque::from([start]);
        reachable[start] = true;
        while let Some(n) = queue.pop_front() {
            for &e in &outgoing[n] {
                let target = endpoints[e].1;
                if !reachable[target] {
                    reachable[target] = true;
                    queue.push_back(target);
                }
            }
        }

        let mut incoming = vec![Vec::new(); nodes.len()];
        for (e, &(source, target)) in endpoints.iter().enumerate() {
            if reachable[source] {
                incoming[target].push(e);
            }
        }

        for (i, node) in nodes.iter().enumerate() {
            if !reachable[i] {
                tracing::warn!(
                    workflow_id = %workflow.id,
                    node_id = %node.node.id,
                    "node is unreachable from the start node and will never run"
                );
            }
        }

        Ok(Self {
            nodes,
            edges: workflow.edges.clone(),
            index,
            outgoing,
            incoming,
            reachable,
            start,
        })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &GraphNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, node_id: &str) -> Option<usize> {
        self.index.get(node_id).copied()
    }

    pub fn is_reachable(&self, idx: usize) -> bool {
        self.reachable[idx]
    }

    /// Outgoing edges of `idx` paired with their target index, in definition order.
    pub fn outgoing(&self, idx: usize) -> impl Iterator<Item = (&Edge, usize)> + '_ {
        self.outgoing[idx].iter().map(move |&e| {
            let edge = &self.edges[e];
            (edge, self.index[&edge.target])
        })
    }

    /// Number of reachable incoming edges of `idx`.
    pub fn incoming_count(&self, idx: usize) -> usize {
        self.incoming[idx].len()
    }
}

fn lookup(index: &HashMap<String, usize>, edge: &Edge, node_id: &str) -> Result<usize, ValidationError> {
    index
        .get(node_id)
        .copied()
        .ok_or_else(|| ValidationError::UnknownEdgeEndpoint {
            edge_id: edge.id.clone(),
            node_id: node_id.to_string(),
        })
}

fn detect_cycle(nodes: &[GraphNode], endpoints: &[(usize, usize)]) -> Result<(), ValidationError> {
    let mut graph = DiGraph::<usize, ()>::new();
    let indices: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
    for &(source, target) in endpoints {
        graph.add_edge(indices[source], indices[target], ());
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        let idx = graph[cycle.node_id()];
        ValidationError::CycleDetected(nodes[idx].node.id.clone())
    })
}

/// The explicit trigger node if there is exactly one, else the unique node
/// with no incoming edge.
fn resolve_start(nodes: &[GraphNode], endpoints: &[(usize, usize)]) -> Result<usize, ValidationError> {
    let triggers: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.kind == NodeKind::Trigger)
        .map(|(i, _)| i)
        .collect();

    match triggers.as_slice() {
        [only] => return Ok(*only),
        [] => {}
        many => {
            return Err(ValidationError::AmbiguousStart(format!(
                "{} trigger nodes: {}",
                many.len(),
                join_ids(nodes, many)
            )));
        }
    }

    let mut has_incoming = vec![false; nodes.len()];
    for &(_, target) in endpoints {
        has_incoming[target] = true;
    }
    let roots: Vec<usize> = (0..nodes.len()).filter(|&i| !has_incoming[i]).collect();

    match roots.as_slice() {
        [only] => Ok(*only),
        [] => Err(ValidationError::AmbiguousStart(
            "no trigger node and every node has an incoming edge".into(),
        )),
        many => Err(ValidationError::AmbiguousStart(format!(
            "no trigger node and {} nodes without incoming edges: {}",
            many.len(),
            join_ids(nodes, many)
        ))),
    }
}

fn join_ids(nodes: &[GraphNode], idxs: &[usize]) -> String {
    idxs.iter()
        .map(|&i| nodes[i].node.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
