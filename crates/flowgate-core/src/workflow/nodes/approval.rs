//! The `human-approval` node. It never completes on its own; it asks the
//! engine to park the run until someone decides.

use flowgate_types::workflow::Node;
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::workflow::context::NodeScope;
use crate::workflow::interpolate::render;
use crate::workflow::registry::{NodeExecutor, NodeResult, SuspendRequest, parse_config};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalConfig {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "timeout_secs")]
    timeout_secs: Option<u64>,
}

pub struct HumanApprovalExecutor;

impl NodeExecutor for HumanApprovalExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: ApprovalConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            let view = ctx.view();
            let title = match config.title {
                Some(t) => render(&t, &view),
                None => format!("Approval required: {}", node.label()),
            };
            NodeResult::suspend(SuspendRequest {
                title,
                description: config.description.map(|d| render(&d, &view)),
                timeout_secs: config.timeout_secs,
            })
        })
    }
}
