use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::crd::CharlesDeployment;
use crate::error::{Error, Result};
use crate::identity::ResourceIdentity;
use crate::telemetry::names;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

pub fn owner_reference(parent: &CharlesDeployment) -> Result<OwnerReference> {
    let uid = parent.uid().ok_or(Error::MissingField("metadata.uid"))?;
    Ok(OwnerReference {
        api_version: CharlesDeployment::api_version(&()).to_string(),
        kind: CharlesDeployment::kind(&()).to_string(),
        name: parent.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Adds `owner` to the manifest's owner references, replacing any earlier link
/// carrying the same uid. An object may have only one controller, so other
/// references lose their controller flag when `owner` claims it.
pub fn stamp_owner(manifest: &mut DynamicObject, owner: &OwnerReference) {
    let refs = manifest.metadata.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.uid != owner.uid);
    if owner.controller == Some(true) {
        for other in refs.iter_mut().filter(|r| r.controller == Some(true)) {
            other.controller = None;
        }
    }
    refs.push(owner.clone());
}

/// Creates `manifest` unless an object with the same identity, namespace and
/// name already exists. Existing objects are left untouched.
pub async fn create_if_absent(
    cluster: &dyn ClusterApi,
    mut manifest: DynamicObject,
    owner: &OwnerReference,
) -> Result<CreateOutcome> {
    stamp_owner(&mut manifest, owner);

    let identity = ResourceIdentity::of(&manifest)?;
    let name = manifest
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingField("metadata.name"))?;
    let namespace = manifest.metadata.namespace.clone();

    if cluster.get(&identity, namespace.as_deref(), &name).await?.is_some() {
        debug!("{} {} already exists, leaving it as is", identity.kind, name);
        return Ok(CreateOutcome::AlreadyExists);
    }

    match cluster.create(&identity, namespace.as_deref(), &manifest).await {
        Ok(_) => {
            info!(
                "Created {} {}/{} for {}",
                identity.kind,
                namespace.as_deref().unwrap_or_default(),
                name,
                owner.name
            );
            metrics::counter!(names::CHILDREN_CREATED_TOTAL, "kind" => identity.kind.clone())
                .increment(1);
            Ok(CreateOutcome::Created)
        }
        Err(e) if e.is_conflict() => {
            debug!("{} {} was created concurrently", identity.kind, name);
            Ok(CreateOutcome::AlreadyExists)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "charlescd.io/v1".into(),
            kind: "CharlesDeployment".into(),
            name: "app1".into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn stamping_twice_keeps_a_single_link() {
        let mut manifest: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "web" }
        }))
        .unwrap();

        stamp_owner(&mut manifest, &owner("uid-1"));
        stamp_owner(&mut manifest, &owner("uid-1"));

        let refs = manifest.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].controller, Some(true));
        assert_eq!(refs[0].block_owner_deletion, Some(true));
    }

    #[test]
    fn rendered_controller_link_is_demoted() {
        let mut manifest: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "ReplicaSet",
                    "name": "web-abc",
                    "uid": "rs-uid",
                    "controller": true
                }]
            }
        }))
        .unwrap();

        stamp_owner(&mut manifest, &owner("uid-1"));

        let refs = manifest.owner_references();
        assert_eq!(refs.len(), 2);
        let controllers: Vec<_> = refs.iter().filter(|r| r.controller == Some(true)).collect();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].uid, "uid-1");
        assert_eq!(refs[0].uid, "rs-uid");
        assert_eq!(refs[0].controller, None);
    }

    #[test]
    fn owner_reference_requires_a_uid() {
        let parent = CharlesDeployment::new("app1", Default::default());
        assert!(matches!(
            owner_reference(&parent),
            Err(Error::MissingField("metadata.uid"))
        ));
    }
}
