use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, PostParams};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tracing::debug;

use crate::crd::{CharlesDeployment, ReconcileKey};
use crate::error::{Error, Result};
use crate::identity::ResourceIdentity;

/// One step of a list-then-watch stream. `Init..InitDone` brackets a full
/// listing; `Apply`/`Delete` are incremental changes.
pub use kube::runtime::watcher::Event as WatchEvent;

pub type WatchStream<K> = BoxStream<'static, watcher::Result<WatchEvent<K>>>;

/// Generic access to the cluster: typed for parents, type-erased for children.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn get_parent(&self, key: &ReconcileKey) -> Result<Option<CharlesDeployment>>;

    fn watch_parents(&self, namespace: Option<&str>) -> WatchStream<CharlesDeployment>;

    async fn get(
        &self,
        identity: &ResourceIdentity,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Fails with [`Error::Conflict`] when the object already exists.
    async fn create(
        &self,
        identity: &ResourceIdentity,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    fn watch(&self, identity: &ResourceIdentity, namespace: Option<&str>) -> WatchStream<DynamicObject>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(Error::Kube)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn dynamic_api(&self, identity: &ResourceIdentity, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = identity.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn parent_api(&self, namespace: Option<&str>) -> Api<CharlesDeployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_parent(&self, key: &ReconcileKey) -> Result<Option<CharlesDeployment>> {
        let api: Api<CharlesDeployment> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name).await.map_err(Error::Kube)
    }

    fn watch_parents(&self, namespace: Option<&str>) -> WatchStream<CharlesDeployment> {
        watcher::watcher(self.parent_api(namespace), WatcherConfig::default())
            .default_backoff()
            .boxed()
    }

    async fn get(
        &self,
        identity: &ResourceIdentity,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.dynamic_api(identity, namespace)
            .get_opt(name)
            .await
            .map_err(Error::Kube)
    }

    async fn create(
        &self,
        identity: &ResourceIdentity,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.dynamic_api(identity, namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Create of {} answered {}: {}", identity, e.reason, e.message);
                Err(Error::Conflict(format!(
                    "{}/{}",
                    identity,
                    object.metadata.name.as_deref().unwrap_or_default()
                )))
            }
            Err(e) => Err(Error::Kube(e)),
        }
    }

    fn watch(&self, identity: &ResourceIdentity, namespace: Option<&str>) -> WatchStream<DynamicObject> {
        watcher::watcher(self.dynamic_api(identity, namespace), WatcherConfig::default())
            .default_backoff()
            .boxed()
    }
}
