mod common;

use charles_operator::creator::{create_if_absent, owner_reference};
use charles_operator::{CreateOutcome, Error, MemoryCluster, ResourceIdentity};
use kube::ResourceExt;

use common::{deployment, parent};

fn namespaced(mut manifest: kube::api::DynamicObject, namespace: &str) -> kube::api::DynamicObject {
    manifest.metadata.namespace = Some(namespace.to_string());
    manifest
}

#[tokio::test]
async fn test_create_twice_creates_once() {
    let cluster = MemoryCluster::new();
    let app = cluster.apply_parent(parent("ns", "app1", &[]));
    let owner = owner_reference(&app).unwrap();
    let manifest = namespaced(deployment("web"), "ns");

    let first = create_if_absent(&cluster, manifest.clone(), &owner).await.unwrap();
    let second = create_if_absent(&cluster, manifest, &owner).await.unwrap();

    assert_eq!(first, CreateOutcome::Created);
    assert_eq!(second, CreateOutcome::AlreadyExists);
    assert_eq!(cluster.creates(), 1);

    let identity = ResourceIdentity::new("apps/v1", "Deployment");
    let stored = cluster.object(&identity, Some("ns"), "web").unwrap();
    let refs = stored.owner_references();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name, "app1");
    assert_eq!(refs[0].kind, "CharlesDeployment");
    assert_eq!(Some(refs[0].uid.clone()), app.metadata.uid);
    assert_eq!(refs[0].controller, Some(true));
}

#[tokio::test]
async fn test_existing_object_is_left_untouched() {
    let cluster = MemoryCluster::new();
    let app = cluster.apply_parent(parent("ns", "app1", &[]));
    let owner = owner_reference(&app).unwrap();
    let identity = ResourceIdentity::new("apps/v1", "Deployment");

    create_if_absent(&cluster, namespaced(deployment("web"), "ns"), &owner)
        .await
        .unwrap();
    let before = cluster.object(&identity, Some("ns"), "web").unwrap();

    let mut changed = namespaced(deployment("web"), "ns");
    changed.data["spec"]["replicas"] = serde_json::json!(5);
    let outcome = create_if_absent(&cluster, changed, &owner).await.unwrap();

    assert_eq!(outcome, CreateOutcome::AlreadyExists);
    let after = cluster.object(&identity, Some("ns"), "web").unwrap();
    assert_eq!(before.resource_version(), after.resource_version());
    assert!(after.data["spec"].get("replicas").is_none());
}

#[tokio::test]
async fn test_stale_read_falls_back_to_conflict() {
    let cluster = MemoryCluster::new();
    let app = cluster.apply_parent(parent("ns", "app1", &[]));
    let owner = owner_reference(&app).unwrap();
    let manifest = namespaced(deployment("web"), "ns");

    create_if_absent(&cluster, manifest.clone(), &owner).await.unwrap();

    cluster.set_stale_reads(true);
    let outcome = create_if_absent(&cluster, manifest, &owner).await.unwrap();

    assert_eq!(outcome, CreateOutcome::AlreadyExists);
    assert_eq!(cluster.creates(), 1);
    assert_eq!(cluster.gets(), 2);
}

#[tokio::test]
async fn test_transport_failure_is_propagated() {
    let cluster = MemoryCluster::new();
    let app = cluster.apply_parent(parent("ns", "app1", &[]));
    let owner = owner_reference(&app).unwrap();

    cluster.set_create_failure(Some("connection reset by peer"));
    let err = create_if_absent(&cluster, namespaced(deployment("web"), "ns"), &owner)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(err.kind(), "transport");
    assert!(cluster.objects().is_empty());
}

#[tokio::test]
async fn test_manifest_without_kind_is_rejected() {
    let cluster = MemoryCluster::new();
    let app = cluster.apply_parent(parent("ns", "app1", &[]));
    let owner = owner_reference(&app).unwrap();

    let mut manifest = namespaced(deployment("web"), "ns");
    manifest.types = None;
    let err = create_if_absent(&cluster, manifest, &owner).await.unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(cluster.creates(), 0);
}
