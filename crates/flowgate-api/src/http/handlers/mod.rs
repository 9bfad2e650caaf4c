//! REST handlers, one module per resource.

pub mod approval;
pub mod execution;
pub mod workflow;
