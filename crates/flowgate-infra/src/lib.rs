//! Infrastructure layer for Flowgate.
//!
//! Implements the ports defined in `flowgate-core`: SQLite persistence and
//! the durable job queue, the rhai script sandbox, outbound HTTP and the
//! agent endpoint client, plus the TOML configuration loader.

pub mod config;
pub mod http;
pub mod sandbox;
pub mod sqlite;
