//! End-to-end runtime flows that need no kernel privileges: image import,
//! container registration, inspection and removal.

mod common;

use common::{sample_image_tarball, test_runtime};
use servin::{ContainerFilter, ContainerOptions, ContainerStatus, ServinError};

#[tokio::test]
async fn test_import_then_create_and_remove() {
    let (_dir, runtime) = test_runtime();

    let tarball = sample_image_tarball("alpine:latest");
    let image = runtime.images().import_tarball(&tarball, None).unwrap();
    assert!(image.repo_tags.contains(&"alpine:latest".to_string()));

    let record = runtime
        .create_container(ContainerOptions {
            image: "alpine:latest".into(),
            command: vec!["echo".into(), "Hello".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ContainerStatus::Created);
    assert_eq!(record.pid, 0);

    // Listed and resolvable by name and id prefix.
    let listed = runtime
        .list_containers(&ContainerFilter::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let inspected = runtime.inspect_container(&record.id.as_str()[..10]).unwrap();
    assert_eq!(inspected.id, record.id);

    runtime.remove_container(record.id.as_str(), false).await.unwrap();
    assert!(matches!(
        runtime.inspect_container(record.id.as_str()),
        Err(ServinError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_image_remove_blocked_while_referenced() {
    let (_dir, runtime) = test_runtime();
    let tarball = sample_image_tarball("busy:latest");
    runtime.images().import_tarball(&tarball, None).unwrap();

    let record = runtime
        .create_container(ContainerOptions {
            image: "busy:latest".into(),
            command: vec!["sleep".into(), "60".into()],
            ..Default::default()
        })
        .await
        .unwrap();

    // A created (non-running) container does not block removal.
    runtime.remove_image("busy:latest", false).unwrap();

    // Re-import for cleanliness of the second assertion.
    let tarball = sample_image_tarball("busy:latest");
    runtime.images().import_tarball(&tarball, None).unwrap();
    runtime.remove_container(record.id.as_str(), false).await.unwrap();
}

#[tokio::test]
async fn test_export_import_identity_across_runtimes() {
    let (_dir_a, a) = test_runtime();
    let (_dir_b, b) = test_runtime();

    let tarball = sample_image_tarball("carry:latest");
    let original = a.images().import_tarball(&tarball, None).unwrap();

    let exported = a.images().export_tarball("carry:latest").unwrap();
    let reimported = b.images().import_tarball(&exported, None).unwrap();

    assert_eq!(original.id, reimported.id);
    assert_eq!(original.layers, reimported.layers);
}

#[tokio::test]
async fn test_stop_requires_running_container() {
    let (_dir, runtime) = test_runtime();
    let tarball = sample_image_tarball("alpine:latest");
    runtime.images().import_tarball(&tarball, None).unwrap();

    let record = runtime
        .create_container(ContainerOptions {
            image: "alpine:latest".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(matches!(
        runtime.stop_container(record.id.as_str(), None).await,
        Err(ServinError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_unknown_image_fails_creation() {
    let (_dir, runtime) = test_runtime();
    let result = runtime
        .create_container(ContainerOptions {
            image: "never-imported:latest".into(),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(ServinError::ImageNotFound(_))));
}
