//! HTTP/REST API layer for Flowgate.
//!
//! Axum-based REST API at `/api/v1/` with an envelope response format.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;

#[cfg(test)]
pub(crate) async fn spawn_test_app(state: crate::state::AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = router::build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
