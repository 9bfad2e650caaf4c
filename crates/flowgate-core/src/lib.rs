//! Workflow engine and port definitions for Flowgate.
//!
//! This crate defines the "ports" (repository, queue, sandbox, HTTP and agent
//! traits) that the infrastructure layer implements, plus the engine that
//! drives executions through them. It depends only on `flowgate-types` --
//! never on `flowgate-infra` or any database/IO crate.

pub mod event;
pub mod queue;
pub mod repository;
pub mod workflow;
