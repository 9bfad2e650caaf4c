//! Workflow execution: graph compilation, node executors, the engine and
//! its background workers.

pub mod budget;
pub mod checkpoint;
pub mod cleanup;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod graph;
pub mod interpolate;
pub mod nodes;
pub mod registry;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
