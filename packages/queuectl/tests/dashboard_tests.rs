//! Dashboard router tests (no listener; requests go through tower oneshot).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use queuectl::{dashboard_router, EnqueueRequest, Queue, SqliteStore};
use tower::ServiceExt;

async fn queue_with_history() -> Arc<Queue> {
    let queue = Queue::new(SqliteStore::in_memory().await.unwrap());

    let ok = queue
        .enqueue(EnqueueRequest::builder().command("echo hi").build())
        .await
        .unwrap();
    queue.claim().await.unwrap().expect("claimed");
    queue.complete(&ok.id, "hi\n", 25).await.unwrap();

    queue
        .enqueue(EnqueueRequest::builder().command("echo pending").build())
        .await
        .unwrap();

    Arc::new(queue)
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn index_serves_the_dashboard_page() {
    let app = dashboard_router(queue_with_history().await);
    let (status, body) = get(app, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("QueueCtl"));
}

#[tokio::test]
async fn stats_endpoint_returns_camel_case_derived_metrics() {
    let app = dashboard_router(queue_with_history().await);
    let (status, body) = get(app, "/api/stats").await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["pending"], 1);
    assert_eq!(json["completed"], 1);
    assert_eq!(json["totalCompleted"], 1);
    assert_eq!(json["successRate"], 100);
    assert_eq!(json["avgExecutionTime"], 25.0);
}

#[tokio::test]
async fn jobs_endpoint_filters_by_state() {
    let app = dashboard_router(queue_with_history().await);
    let (status, body) = get(app, "/api/jobs?state=completed&limit=10").await;

    assert_eq!(status, StatusCode::OK);
    let jobs: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["command"], "echo hi");
    assert_eq!(jobs[0]["state"], "completed");
}

#[tokio::test]
async fn jobs_endpoint_rejects_an_unknown_state() {
    let app = dashboard_router(queue_with_history().await);
    let (status, _) = get(app, "/api/jobs?state=bogus").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn unknown_paths_are_404() {
    let app = dashboard_router(queue_with_history().await);
    let (status, _) = get(app, "/api/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
