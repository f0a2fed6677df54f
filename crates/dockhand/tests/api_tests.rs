//! HTTP surface tests driven through the router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::test_app;
use dockhand::engine::ContainerState;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_engine_state() {
    let app = test_app().await;
    let response = app.router.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine"], "available");
    assert_eq!(body["engineVersion"], "fake 1.0");

    app.engine.set_unavailable(true);
    let body = body_json(app.router.oneshot(get("/api/health")).await.unwrap()).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["engine"], "unavailable");
}

#[tokio::test]
async fn containers_endpoint_syncs_first() {
    let app = test_app().await;
    app.engine
        .add_container("a1", "web", "nginx:latest", ContainerState::Running);

    let response = app.router.oneshot(get("/api/containers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["containerId"], "a1");
    assert_eq!(records[0]["status"], "running");
}

#[tokio::test]
async fn sync_failure_keeps_mirror_and_returns_503() {
    let app = test_app().await;
    app.engine
        .add_container("a1", "web", "nginx:latest", ContainerState::Running);
    app.services.sync.sync().await.unwrap();

    app.engine.set_unavailable(true);
    let response = app
        .router
        .clone()
        .oneshot(post("/api/containers/sync"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");

    let records = app.services.sync.repository().list_all().await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn sync_returns_report() {
    let app = test_app().await;
    app.engine
        .add_container("a1", "web", "nginx:latest", ContainerState::Running);
    app.engine
        .add_container("b2", "db", "postgres:16", ContainerState::Exited);

    let response = app.router.oneshot(post("/api/containers/sync")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["engineContainers"], 2);
    assert_eq!(body["inserted"], 2);
}

#[tokio::test]
async fn cleanup_duplicates_reports_count() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(post("/api/containers/cleanup-duplicates"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "removed": 0 }));
}

#[tokio::test]
async fn proxy_setting_round_trip() {
    let app = test_app().await;

    let body = body_json(
        app.router
            .clone()
            .oneshot(get("/api/settings/proxy"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["url"], Value::Null);

    let response = app
        .router
        .clone()
        .oneshot(put_json(
            "/api/settings/proxy",
            json!({ "url": "http://proxy.local:3128" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(
        app.router
            .clone()
            .oneshot(get("/api/settings/proxy"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["url"], "http://proxy.local:3128");

    let response = app
        .router
        .clone()
        .oneshot(put_json("/api/settings/proxy", json!({ "url": "ftp://nope" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .oneshot(put_json("/api/settings/proxy", json!({ "url": null })))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["url"], Value::Null);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = test_app().await;
    let response = app.router.oneshot(get("/api/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
