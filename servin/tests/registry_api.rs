//! Registry-v2 surface tests driven through the router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{sample_image_tarball, test_runtime};
use serde_json::Value;
use servin::registry::registry_router;
use sha2::{Digest, Sha256};
use tower::util::ServiceExt;

async fn send(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Vec<u8>,
) -> (StatusCode, Vec<(String, String)>, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec();
    (status, headers, bytes)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn test_version_negotiation_and_health() {
    let (_dir, runtime) = test_runtime();
    let router = registry_router(runtime.registry_server().unwrap());

    let (status, headers, _) = send(&router, "GET", "/v2/", vec![]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        header(&headers, "Docker-Distribution-Api-Version"),
        Some("registry/2.0")
    );

    let (status, _, body) = send(&router, "GET", "/health", vec![]).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], "ok");
}

#[tokio::test]
async fn test_catalog_and_tags() {
    let (_dir, runtime) = test_runtime();
    let tarball = sample_image_tarball("team/app:v1");
    runtime.images().import_tarball(&tarball, None).unwrap();
    let router = registry_router(runtime.registry_server().unwrap());

    let (status, _, body) = send(&router, "GET", "/v2/_catalog", vec![]).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["repositories"][0], "team/app");

    let (status, _, body) = send(&router, "GET", "/v2/team/app/tags/list", vec![]).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["name"], "team/app");
    assert_eq!(value["tags"][0], "v1");

    let (status, _, _) = send(&router, "GET", "/v2/ghost/tags/list", vec![]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_fetch_by_tag_and_digest() {
    let (_dir, runtime) = test_runtime();
    let tarball = sample_image_tarball("alpine:latest");
    let record = runtime.images().import_tarball(&tarball, None).unwrap();
    let router = registry_router(runtime.registry_server().unwrap());

    let (status, headers, body) =
        send(&router, "GET", "/v2/alpine/manifests/latest", vec![]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        header(&headers, "Docker-Content-Digest"),
        Some(format!("sha256:{}", record.id).as_str())
    );
    // The served bytes hash to the image id.
    assert_eq!(hex::encode(Sha256::digest(&body)), record.id);

    let (status, _, _) = send(
        &router,
        "GET",
        &format!("/v2/alpine/manifests/sha256:{}", record.id),
        vec![],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_blob_upload_session_and_digest_mismatch() {
    let (_dir, runtime) = test_runtime();
    let router = registry_router(runtime.registry_server().unwrap());

    // Start an upload session.
    let (status, headers, _) =
        send(&router, "POST", "/v2/alpine/blobs/uploads/", vec![]).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let location = header(&headers, "Location").unwrap().to_string();

    // Stream a chunk.
    let chunk = b"layer-bytes-for-upload".to_vec();
    let (status, _, _) = send(&router, "PATCH", &location, chunk.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Commit with the wrong digest is rejected.
    let bad = format!("{location}?digest=sha256%3A{}", "0".repeat(64));
    let (status, _, _) = send(&router, "PUT", &bad, vec![]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A fresh session committed with the right digest lands in the store.
    let (_, headers, _) = send(&router, "POST", "/v2/alpine/blobs/uploads/", vec![]).await;
    let location = header(&headers, "Location").unwrap().to_string();
    let (status, _, _) = send(&router, "PATCH", &location, chunk.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let digest = hex::encode(Sha256::digest(&chunk));
    let commit = format!("{location}?digest=sha256%3A{digest}");
    let (status, headers, _) = send(&router, "PUT", &commit, vec![]).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        header(&headers, "Docker-Content-Digest"),
        Some(format!("sha256:{digest}").as_str())
    );

    // And is now fetchable.
    let (status, _, body) = send(
        &router,
        "GET",
        &format!("/v2/alpine/blobs/sha256:{digest}"),
        vec![],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, chunk);
}

#[tokio::test]
async fn test_manifest_push_registers_image() {
    let (_dir, runtime) = test_runtime();
    let router = registry_router(runtime.registry_server().unwrap());

    // Upload a layer and a config blob through the wire.
    let layer = b"pushed-layer".to_vec();
    let config = serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Cmd": ["/bin/true"]}
    }))
    .unwrap();

    for blob in [&layer, &config] {
        let (_, headers, _) = send(&router, "POST", "/v2/pushed/blobs/uploads/", vec![]).await;
        let location = header(&headers, "Location").unwrap().to_string();
        let digest = hex::encode(Sha256::digest(blob));
        let commit = format!("{location}?digest=sha256%3A{digest}");
        let (status, _, _) = send(&router, "PUT", &commit, blob.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    // Push a distribution-shaped manifest referencing the blobs.
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "config": {"digest": format!("sha256:{}", hex::encode(Sha256::digest(&config))), "size": config.len()},
        "layers": [{"digest": format!("sha256:{}", hex::encode(Sha256::digest(&layer))), "size": layer.len()}]
    });
    let (status, _, _) = send(
        &router,
        "PUT",
        "/v2/pushed/manifests/v1",
        manifest.to_string().into_bytes(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Visible through the image store.
    let record = runtime.images().inspect("pushed:v1").unwrap();
    assert_eq!(record.layers.len(), 1);
}
