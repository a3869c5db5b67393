use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::Query, response::Html, routing::get, Router};
use tdp_storage::{FetchError, HttpClientConfig, HttpSource, ReqwestSource, SourceRequest};
use tokio::net::TcpListener;

async fn spawn_server() -> SocketAddr {
    let app = Router::new()
        .route(
            "/wiki/Paris",
            get(|| async { Html("<html><body><p>Paris is the capital of France.</p></body></html>") }),
        )
        .route(
            "/echo",
            get(|Query(params): Query<Vec<(String, String)>>| async move {
                params
                    .into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&")
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn source(timeout: Duration) -> ReqwestSource {
    ReqwestSource::new(HttpClientConfig {
        timeout,
        user_agent: Some("tdp-test/0.1".to_string()),
    })
    .expect("client")
}

#[tokio::test]
async fn successful_page_is_returned_with_content_type() {
    let addr = spawn_server().await;
    let resp = source(Duration::from_secs(5))
        .get(&SourceRequest::get(format!("http://{addr}/wiki/Paris")))
        .await
        .expect("fetch");
    assert_eq!(resp.status, 200);
    assert!(resp.is_success());
    assert!(resp.content_type.starts_with("text/html"));
    assert!(String::from_utf8_lossy(&resp.body).contains("capital of France"));
}

#[tokio::test]
async fn missing_page_is_a_response_not_an_error() {
    let addr = spawn_server().await;
    let resp = source(Duration::from_secs(5))
        .get(&SourceRequest::get(format!("http://{addr}/wiki/InvalidPage")))
        .await
        .expect("404 still yields a response");
    assert_eq!(resp.status, 404);
    assert!(!resp.is_success());
}

#[tokio::test]
async fn query_is_sent_but_stripped_from_final_url() {
    let addr = spawn_server().await;
    let resp = source(Duration::from_secs(5))
        .get(&SourceRequest::get(format!("http://{addr}/echo")).with_query("appid", "secret"))
        .await
        .expect("fetch");
    assert_eq!(String::from_utf8_lossy(&resp.body), "appid=secret");
    assert!(!resp.final_url.contains("secret"));
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let addr = spawn_server().await;
    let err = source(Duration::from_millis(200))
        .get(&SourceRequest::get(format!("http://{addr}/slow")))
        .await
        .expect_err("must time out");
    assert!(matches!(err, FetchError::Timeout), "got {err:?}");
}
