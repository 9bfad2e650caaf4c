//! The `http` node and the client seam it calls through.

use std::collections::BTreeMap;
use std::sync::Arc;

use flowgate_types::workflow::Node;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::workflow::context::NodeScope;
use crate::workflow::interpolate::{interpolate_value, render, value_to_string};
use crate::workflow::registry::{NodeExecutor, NodeResult, parse_config};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, otherwise the body as a string.
    pub body: Value,
}

/// Outbound HTTP. Transport failures are `Err`; any HTTP status is `Ok`.
pub trait HttpClient: Send + Sync {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, Result<HttpResponse, String>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default, alias = "timeout_ms")]
    timeout_ms: Option<u64>,
    #[serde(default = "default_fail_on_status", alias = "fail_on_status")]
    fail_on_status: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_fail_on_status() -> bool {
    true
}

pub struct HttpExecutor {
    client: Arc<dyn HttpClient>,
}

impl HttpExecutor {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

impl NodeExecutor for HttpExecutor {
    fn execute<'a>(&'a self, node: &'a Node, ctx: &'a NodeScope<'a>) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: HttpConfig = match parse_config(node) {
                Ok(c) => c,
                Err(e) => return NodeResult::fail(e),
            };
            let view = ctx.view();
            let request = HttpRequest {
                method: config.method.to_ascii_uppercase(),
                url: render(&config.url, &view),
                headers: config
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_string(&interpolate_value(v, &view))))
                    .collect(),
                body: config.body.as_ref().map(|b| interpolate_value(b, &view)),
                timeout_ms: config.timeout_ms,
            };

            tracing::debug!(node_id = %node.id, method = %request.method, url = %request.url, "sending http request");
            let response = match self.client.send(request).await {
                Ok(r) => r,
                Err(e) => return NodeResult::fail(format!("http request failed: {e}")),
            };

            let output = json!({
                "status": response.status,
                "headers": response.headers,
                "body": response.body,
            });
            if config.fail_on_status && response.status >= 400 {
                return NodeResult::fail(format!("http request returned status {}", response.status))
                    .with_output(output);
            }
            NodeResult::ok(output)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workflow::context::ExecutionContext;
    use flowgate_types::workflow::NodeKind;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Records requests and answers with a canned response.
    pub(crate) struct MockHttp {
        pub status: u16,
        pub body: Value,
        pub seen: Mutex<Vec<HttpRequest>>,
    }

    impl MockHttp {
        pub(crate) fn new(status: u16, body: Value) -> Self {
            Self {
                status,
                body,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for MockHttp {
        fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, Result<HttpResponse, String>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(request);
                Ok(HttpResponse {
                    status: self.status,
                    headers: BTreeMap::new(),
                    body: self.body.clone(),
                })
            })
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::seed(Uuid::now_v7(), Uuid::now_v7(), &[], json!({"user_id": 42, "token": "t0k"}))
    }

    #[tokio::test]
    async fn interpolates_request_parts() {
        let mock = Arc::new(MockHttp::new(200, json!({"ok": true})));
        let executor = HttpExecutor::new(mock.clone());
        let node = Node::new(
            "fetch",
            NodeKind::Http,
            json!({
                "method": "post",
                "url": "https://api.example.test/users/{{user_id}}",
                "headers": {"Authorization": "Bearer {{token}}"},
                "body": {"id": "{{user_id}}"}
            }),
        );
        let result = executor.execute(&node, &ctx().scope("h", Value::Null)).await;
        assert!(result.success);
        assert_eq!(result.output.unwrap()["body"], json!({"ok": true}));

        let seen = mock.seen.lock().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "https://api.example.test/users/42");
        assert_eq!(seen[0].headers["Authorization"], "Bearer t0k");
        assert_eq!(seen[0].body, Some(json!({"id": 42})));
    }

    #[tokio::test]
    async fn error_status_fails_unless_disabled() {
        let executor = HttpExecutor::new(Arc::new(MockHttp::new(503, json!("down"))));
        let node = Node::new("h", NodeKind::Http, json!({"url": "http://x.test"}));
        let result = executor.execute(&node, &ctx().scope("h", Value::Null)).await;
        assert!(!result.success);
        assert_eq!(result.output.unwrap()["status"], json!(503));

        let node = Node::new("h", NodeKind::Http, json!({"url": "http://x.test", "failOnStatus": false}));
        let result = executor.execute(&node, &ctx().scope("h", Value::Null)).await;
        assert!(result.success);
    }
}
