//! Storage ports implemented by `flowgate-infra`.

pub mod workflow;
