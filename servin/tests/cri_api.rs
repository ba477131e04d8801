//! CRI surface tests driven through the router, covering the sandbox and
//! container verbs plus the image service.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{sample_image_tarball, test_runtime};
use serde_json::{Value, json};
use servin::cri::cri_router;
use tower::util::ServiceExt;

async fn call(router: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&bytes).unwrap_or(json!({}))
    };
    (status, value)
}

#[tokio::test]
async fn test_version_and_status() {
    let (_dir, runtime) = test_runtime();
    let router = cri_router(runtime.cri_server());

    let (status, body) = call(&router, "/v1/runtime/version", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runtime_name"], "servin");
    assert_eq!(body["runtime_api_version"], "v1alpha2");

    let (status, body) = call(&router, "/v1/runtime/status", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["conditions"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn test_sandbox_lifecycle() {
    let (_dir, runtime) = test_runtime();
    let tarball = sample_image_tarball("alpine:latest");
    runtime.images().import_tarball(&tarball, None).unwrap();
    let router = cri_router(runtime.cri_server());

    // Create a sandbox.
    let (status, body) = call(
        &router,
        "/v1/runtime/sandbox/create",
        json!({"config": {"metadata": {"name": "test", "namespace": "default", "uid": "u1"}}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sandbox_id = body["pod_sandbox_id"].as_str().unwrap().to_string();
    // 16 random bytes rendered as hex.
    assert_eq!(sandbox_id.len(), 32);

    // Create a container under it.
    let (status, body) = call(
        &router,
        "/v1/runtime/container/create",
        json!({
            "pod_sandbox_id": sandbox_id,
            "config": {
                "metadata": {"name": "app"},
                "image": {"image": "alpine:latest"},
                "command": ["/bin/sh"],
                "args": ["-c", "sleep 5"]
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let container_id = body["container_id"].as_str().unwrap().to_string();

    // The container list has exactly one entry bound to the sandbox.
    let (status, body) = call(&router, "/v1/runtime/container/list", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let containers = body["containers"].as_array().unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0]["pod_sandbox_id"], sandbox_id.as_str());
    assert_eq!(containers[0]["id"], container_id.as_str());
    assert_eq!(containers[0]["state"], "CONTAINER_CREATED");

    // Removing the sandbox removes its containers first.
    let (status, _) = call(
        &router,
        "/v1/runtime/sandbox/remove",
        json!({"pod_sandbox_id": sandbox_id}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&router, "/v1/runtime/container/list", json!({})).await;
    assert!(body["containers"].as_array().unwrap().is_empty());
    let (_, body) = call(&router, "/v1/runtime/sandbox/list", json!({})).await;
    assert!(body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_container_maps_to_not_found() {
    let (_dir, runtime) = test_runtime();
    let router = cri_router(runtime.cri_server());

    let (status, body) = call(
        &router,
        "/v1/runtime/container/start",
        json!({"container_id": "nope"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "not-found");
}

#[tokio::test]
async fn test_image_service() {
    let (_dir, runtime) = test_runtime();
    let tarball = sample_image_tarball("alpine:latest");
    let imported = runtime.images().import_tarball(&tarball, None).unwrap();
    let router = cri_router(runtime.cri_server());

    let (status, body) = call(&router, "/v1/image/list", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let images = body["images"].as_array().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0]["id"], imported.id.as_str());

    let (status, body) = call(
        &router,
        "/v1/image/status",
        json!({"image": {"image": "alpine:latest"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["image"]["id"], imported.id.as_str());

    // Status for a missing image is an empty result, not an error.
    let (status, body) = call(
        &router,
        "/v1/image/status",
        json!({"image": {"image": "ghost:latest"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["image"].is_null());

    // Pull of an already-local image short-circuits to its id.
    let (status, body) = call(
        &router,
        "/v1/image/pull",
        json!({"image": {"image": "alpine:latest"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["image_ref"], imported.id.as_str());

    let (status, body) = call(&router, "/v1/image/fs-info", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["image_filesystems"].as_array().unwrap().len() == 1);
}
