//! SQLite storage layer.
//!
//! Repository and job queue implementations backed by SQLite with WAL mode
//! and split read/write connection pools.

pub mod pool;
pub mod queue;
pub mod workflow;

pub use pool::DatabasePool;
pub use queue::SqliteJobQueue;
pub use workflow::SqliteWorkflowRepository;
