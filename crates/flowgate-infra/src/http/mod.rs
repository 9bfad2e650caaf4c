//! Outbound HTTP: the `http` node client and the `ai-agent` model invoker.

pub mod agent;
pub mod client;

pub use agent::OpenAiCompatInvoker;
pub use client::ReqwestHttpClient;

#[cfg(test)]
pub(crate) async fn spawn_test_server(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
