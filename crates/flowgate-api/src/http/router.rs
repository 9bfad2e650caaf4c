//! Axum router configuration with middleware.
//!
//! All resource routes are under `/api/v1/`; `/health` sits at the root.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Definitions
        .route(
            "/workflows",
            post(handlers::workflow::create_workflow).get(handlers::workflow::list_workflows),
        )
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route("/workflows/{id}/execute", post(handlers::workflow::execute_workflow))
        .route("/workflows/{id}/executions", get(handlers::workflow::list_executions))
        // Executions
        .route("/executions/{id}", get(handlers::execution::get_execution))
        .route("/executions/{id}/cancel", post(handlers::execution::cancel_execution))
        .route("/executions/{id}/approvals", get(handlers::execution::list_approvals))
        // Approvals
        .route("/approvals/{id}/resume", post(handlers::approval::resume_approval));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use crate::http::spawn_test_app;
    use crate::state::test_state;

    fn approval_flow() -> Value {
        json!({
            "name": "refund",
            "status": "active",
            "nodes": [
                {"id": "start", "type": "trigger"},
                {"id": "gate", "type": "human-approval", "config": {"title": "Refund {{amount}}?"}},
                {"id": "done", "type": "end"}
            ],
            "edges": [
                {"id": "e1", "source": "start", "target": "gate"},
                {"id": "e2", "source": "gate", "target": "done"}
            ]
        })
    }

    async fn create(client: &reqwest::Client, base: &str, definition: Value) -> String {
        let resp = client
            .post(format!("{base}/api/v1/workflows"))
            .json(&definition)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["data"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_dir, state) = test_state().await;
        let base = spawn_test_app(state).await;
        let body: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn approval_round_trip_over_rest() {
        let (_dir, state) = test_state().await;
        let base = spawn_test_app(state).await;
        let client = reqwest::Client::new();
        let workflow_id = create(&client, &base, approval_flow()).await;

        let resp = client
            .post(format!("{base}/api/v1/workflows/{workflow_id}/execute"))
            .json(&json!({"input": {"amount": 30}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["status"], "waiting");
        let execution_id = body["data"]["execution_id"].as_str().unwrap().to_string();

        let approvals: Value = client
            .get(format!("{base}/api/v1/executions/{execution_id}/approvals"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(approvals["data"][0]["title"], "Refund 30?");
        let approval_id = approvals["data"][0]["id"].as_str().unwrap().to_string();

        let resume = |approved: bool| {
            client
                .post(format!("{base}/api/v1/approvals/{approval_id}/resume"))
                .json(&json!({"approved": approved, "decided_by": "ops"}))
                .send()
        };
        let first = resume(true).await.unwrap();
        assert_eq!(first.status(), 200);
        let body: Value = first.json().await.unwrap();
        assert_eq!(body["data"]["status"], "completed");

        let second = resume(false).await.unwrap();
        assert_eq!(second.status(), 409);
        let body: Value = second.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "CONFLICT");

        let listed: Value = client
            .get(format!("{base}/api/v1/workflows/{workflow_id}/executions?limit=5"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);
        assert_eq!(listed["data"][0]["status"], "completed");
    }

    #[tokio::test]
    async fn async_execute_is_accepted_and_cancellable() {
        let (_dir, state) = test_state().await;
        let base = spawn_test_app(state).await;
        let client = reqwest::Client::new();
        let workflow_id = create(&client, &base, approval_flow()).await;

        let resp = client
            .post(format!("{base}/api/v1/workflows/{workflow_id}/execute"))
            .json(&json!({"input": {}, "async": true, "priority": 5}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["status"], "queued");
        let execution_id = body["data"]["execution_id"].as_str().unwrap().to_string();

        let cancelled: Value = client
            .post(format!("{base}/api/v1/executions/{execution_id}/cancel"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cancelled["data"]["status"], "cancelled");
    }

    #[tokio::test]
    async fn invalid_definitions_and_unknown_ids_map_to_client_errors() {
        let (_dir, state) = test_state().await;
        let base = spawn_test_app(state).await;
        let client = reqwest::Client::new();

        let cyclic = json!({
            "name": "loop",
            "nodes": [
                {"id": "start", "type": "trigger"},
                {"id": "a", "type": "log"},
                {"id": "b", "type": "log"}
            ],
            "edges": [
                {"id": "e1", "source": "start", "target": "a"},
                {"id": "e2", "source": "a", "target": "b"},
                {"id": "e3", "source": "b", "target": "a"}
            ]
        });
        let resp = client
            .post(format!("{base}/api/v1/workflows"))
            .json(&cyclic)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let missing = uuid::Uuid::now_v7();
        let resp = client
            .get(format!("{base}/api/v1/executions/{missing}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let resp = client
            .post(format!("{base}/api/v1/workflows/{missing}/execute"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
