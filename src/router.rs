use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::ResourceExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cluster::ClusterApi;
use crate::crd::{CharlesDeployment, ReconcileKey};
use crate::queue::WorkQueue;
use crate::telemetry::names;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildEvent {
    Applied,
    Deleted,
    Resync,
}

impl fmt::Display for ChildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChildEvent::Applied => "applied",
            ChildEvent::Deleted => "deleted",
            ChildEvent::Resync => "resynced",
        };
        f.write_str(name)
    }
}

/// Best-effort map from parent uid to its reconcile key. Entries may be stale;
/// a miss only costs a direct fetch.
#[derive(Clone, Default)]
pub struct ParentCache {
    by_uid: Arc<RwLock<HashMap<String, ReconcileKey>>>,
}

impl ParentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, parent: &CharlesDeployment) {
        if let Some(uid) = parent.uid() {
            self.by_uid.write().insert(uid, parent.key());
        }
    }

    pub fn forget(&self, parent: &CharlesDeployment) {
        if let Some(uid) = parent.uid() {
            self.by_uid.write().remove(&uid);
        }
    }

    pub fn get(&self, uid: &str) -> Option<ReconcileKey> {
        self.by_uid.read().get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_uid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps child events back to the owning parents and enqueues them.
#[derive(Clone)]
pub struct OwnershipRouter {
    cluster: Arc<dyn ClusterApi>,
    queue: WorkQueue<ReconcileKey>,
    parents: ParentCache,
}

impl OwnershipRouter {
    pub fn new(cluster: Arc<dyn ClusterApi>, queue: WorkQueue<ReconcileKey>, parents: ParentCache) -> Self {
        Self {
            cluster,
            queue,
            parents,
        }
    }

    /// Returns the number of parents enqueued for this event.
    pub async fn route(&self, event: ChildEvent, child: &DynamicObject) -> usize {
        let owner_kind = CharlesDeployment::owner_kind();
        let links: Vec<&OwnerReference> = child
            .owner_references()
            .iter()
            .filter(|r| r.kind == owner_kind)
            .collect();
        if links.is_empty() {
            return 0;
        }

        debug!(
            "{} {} {}",
            child.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("object"),
            child.name_any(),
            event
        );

        let mut enqueued = 0;
        for link in links {
            if let Some(key) = self.resolve(child, link).await {
                debug!("Queueing {} after child {}", key, event);
                self.queue.add(key);
                metrics::counter!(names::ROUTER_ENQUEUED_TOTAL).increment(1);
                enqueued += 1;
            }
        }
        enqueued
    }

    async fn resolve(&self, child: &DynamicObject, link: &OwnerReference) -> Option<ReconcileKey> {
        if let Some(key) = self.parents.get(&link.uid) {
            return Some(key);
        }

        let Some(namespace) = child.namespace() else {
            debug!("Cannot resolve owner {} of cluster-scoped {}", link.name, child.name_any());
            return None;
        };
        let key = ReconcileKey::new(namespace, link.name.clone());
        match self.cluster.get_parent(&key).await {
            Ok(Some(parent)) => {
                self.parents.observe(&parent);
                Some(key)
            }
            Ok(None) => {
                debug!("Owner {} of {} no longer exists", key, child.name_any());
                None
            }
            Err(e) => {
                warn!("Error getting owner {} of {}: {}", key, child.name_any(), e);
                None
            }
        }
    }
}
