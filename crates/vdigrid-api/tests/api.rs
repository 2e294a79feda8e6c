//! Router tests against an in-memory store.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use vdigrid_api::build_router;
use vdigrid_state::*;

fn router_with_store() -> (Router, Arc<StateStore>) {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    (build_router(store.clone()), store)
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn post(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/applications")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn list_applications_empty() {
    let (router, _) = router_with_store();
    let (status, body) = send(&router, get("/api/v1/applications")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn create_then_get_application() {
    let (router, store) = router_with_store();

    let (status, body) = send(
        &router,
        post(json!({"name": "office", "users_per_small": 4, "cluster_headroom": 8, "ssh_key": "office.pem"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], "office");
    assert_eq!(body["data"]["scale_interarrival"], 60);

    let (status, body) = send(&router, get("/api/v1/applications/office")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cluster_headroom"], 8);

    let stored = store.get_application("office").unwrap().unwrap();
    assert_eq!(stored.next_run_at, 0);
}

#[tokio::test]
async fn invalid_application_is_bad_request() {
    let (router, store) = router_with_store();

    let (status, body) = send(
        &router,
        post(json!({"name": "office:east", "users_per_small": 4, "ssh_key": "k.pem"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(
        &router,
        post(json!({"name": "office", "users_per_small": 0, "ssh_key": "k.pem"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(store.list_applications().unwrap().is_empty());
}

#[tokio::test]
async fn missing_application_is_not_found() {
    let (router, _) = router_with_store();
    let (status, body) = send(&router, get("/api/v1/applications/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "application not found");

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/v1/applications/nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, delete).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_removes_application() {
    let (router, store) = router_with_store();
    send(
        &router,
        post(json!({"name": "office", "users_per_small": 4, "ssh_key": "k.pem"})),
    )
    .await;

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/v1/applications/office")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert!(store.get_application("office").unwrap().is_none());
}

#[tokio::test]
async fn instances_are_listed_per_application() {
    let (router, store) = router_with_store();
    store
        .put_instance(&Instance::booting("office", "i-1", 1_000, 1))
        .unwrap();
    store
        .put_instance(&Instance::booting("lab", "i-2", 1_000, 1))
        .unwrap();

    let (status, body) = send(&router, get("/api/v1/applications/office/instances")).await;
    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["instance_id"], "i-1");
    assert_eq!(data[0]["state"], "booting");
}
