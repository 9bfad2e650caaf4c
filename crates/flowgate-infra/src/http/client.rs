//! reqwest-backed `HttpClient` for `http` nodes.

use std::collections::BTreeMap;
use std::time::Duration;

use flowgate_core::workflow::nodes::{HttpClient, HttpRequest, HttpResponse};
use flowgate_types::config::HttpSettings;
use futures_util::future::BoxFuture;
use reqwest::Method;
use serde_json::Value;

/// Shared connection pool for every `http` node in the process.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.as_str())
            .build()?;
        Ok(Self { client })
    }

    async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| format!("invalid method {}: {e}", request.method))?;

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Some(Value::String(text)) => builder.body(text),
            Some(body) => builder.json(&body),
            None => builder,
        };
        if let Some(ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| format!("failed to read response body: {e}"))?;

        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(HttpResponse { status, headers, body })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, Result<HttpResponse, String>> {
        Box::pin(self.send_request(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::spawn_test_server;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use serde_json::json;

    fn client() -> ReqwestHttpClient {
        ReqwestHttpClient::new(&HttpSettings::default()).unwrap()
    }

    fn request(method: &str, url: String) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            url,
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: None,
        }
    }

    async fn server() -> String {
        let router = axum::Router::new()
            .route("/json", get(|| async { Json(json!({"ok": true})) }))
            .route("/text", get(|| async { "plain" }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route(
                "/echo",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    let tag = headers
                        .get("x-tag")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({"tag": tag, "body": body}))
                }),
            );
        spawn_test_server(router).await
    }

    #[tokio::test]
    async fn parses_json_and_text_bodies() {
        let base = server().await;
        let client = client();

        let json_resp = client.send(request("GET", format!("{base}/json"))).await.unwrap();
        assert_eq!(json_resp.status, 200);
        assert_eq!(json_resp.body, json!({"ok": true}));
        assert!(json_resp.headers.contains_key("content-type"));

        let text_resp = client.send(request("GET", format!("{base}/text"))).await.unwrap();
        assert_eq!(text_resp.body, json!("plain"));
    }

    #[tokio::test]
    async fn sends_headers_and_json_body() {
        let base = server().await;
        let mut req = request("POST", format!("{base}/echo"));
        req.headers.insert("x-tag".into(), "abc".into());
        req.body = Some(json!({"n": 1}));

        let resp = client().send(req).await.unwrap();
        assert_eq!(resp.body, json!({"tag": "abc", "body": {"n": 1}}));
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let base = server().await;
        let resp = client().send(request("GET", format!("{base}/missing"))).await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body, json!("nope"));
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let err = client()
            .send(request("GET", "http://127.0.0.1:1/unreachable".into()))
            .await
            .unwrap_err();
        assert!(!err.is_empty());
    }
}
