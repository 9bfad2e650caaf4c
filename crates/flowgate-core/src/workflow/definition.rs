//! Workflow definition files.
//!
//! Definitions are authored as YAML or JSON. A file carries only the graph;
//! ids, timestamps and metrics are filled in when it is turned into a
//! `Workflow`. Every parsed definition is compiled once so structural
//! errors surface at load time.

use std::path::{Path, PathBuf};

use chrono::Utc;
use flowgate_types::workflow::{Edge, Node, VariableDefinition, Workflow, WorkflowMetrics, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::error::ValidationError;
use super::graph::WorkflowGraph;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// The authored shape of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Keep an existing id when re-applying an exported definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_config: Option<Value>,
}

impl WorkflowDefinition {
    pub fn into_workflow(self) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            name: self.name,
            version: self.version.unwrap_or(1),
            status: self.status,
            nodes: self.nodes,
            edges: self.edges,
            variables: self.variables,
            trigger_config: self.trigger_config,
            metrics: WorkflowMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<&Workflow> for WorkflowDefinition {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: Some(workflow.id),
            name: workflow.name.clone(),
            version: Some(workflow.version),
            status: workflow.status,
            nodes: workflow.nodes.clone(),
            edges: workflow.edges.clone(),
            variables: workflow.variables.clone(),
            trigger_config: workflow.trigger_config.clone(),
        }
    }
}

fn validated(def: WorkflowDefinition) -> Result<Workflow, DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::Parse("workflow name cannot be empty".into()));
    }
    let workflow = def.into_workflow();
    WorkflowGraph::build(&workflow)?;
    Ok(workflow)
}

/// Parse and validate a YAML definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validated(def)
}

/// Parse and validate a JSON definition.
pub fn parse_workflow_json(json: &str) -> Result<Workflow, DefinitionError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validated(def)
}

/// Export a workflow as a YAML definition.
pub fn serialize_workflow_yaml(workflow: &Workflow) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(&WorkflowDefinition::from(workflow))
        .map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load a definition file. `.json` files are parsed as JSON, anything else
/// as YAML.
pub fn load_workflow_file(path: &Path) -> Result<Workflow, DefinitionError> {
    let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Load every `.yaml`, `.yml` and `.json` definition directly under `dir`,
/// sorted by path. Files that fail to load are skipped with a warning.
pub fn discover_workflows(dir: &Path) -> Result<Vec<(PathBuf, Workflow)>, DefinitionError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DefinitionError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml" | "json")
                )
        })
        .collect();
    paths.sort();

    let mut found = Vec::with_capacity(paths.len());
    for path in paths {
        match load_workflow_file(&path) {
            Ok(workflow) => found.push((path, workflow)),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping workflow file"),
        }
    }
    Ok(found)
}
