//! Shared domain types for Flowgate.
//!
//! This crate contains the domain types used across the engine: workflow
//! graphs, executions, approvals, queue jobs, sandbox contracts, events and
//! configuration, plus the storage error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod job;
pub mod sandbox;
pub mod workflow;
