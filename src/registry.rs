//! Process-wide cache of child watches.
//!
//! One background task runs per `(identity, namespace)` pair. It drives a
//! [`reflector`] so the objects seen so far are kept in a [`Store`], hands each
//! change to the [`OwnershipRouter`], and re-delivers the whole store every
//! resync period. Entries are created on first use and live until
//! [`WatchRegistry::shutdown`]; the number of distinct child kinds is assumed
//! to stay small.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use kube::api::DynamicObject;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, WatchEvent};
use crate::error::{Error, Result};
use crate::identity::ResourceIdentity;
use crate::router::{ChildEvent, OwnershipRouter};
use crate::telemetry::names;

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub identity: ResourceIdentity,
    pub namespace: Option<String>,
}

struct WatchEntry {
    reader: Store<DynamicObject>,
    task: JoinHandle<()>,
}

pub struct WatchRegistry {
    cluster: Arc<dyn ClusterApi>,
    router: OwnershipRouter,
    entries: Mutex<HashMap<WatchKey, Arc<WatchEntry>>>,
    resync_period: Duration,
    sync_timeout: Duration,
}

impl WatchRegistry {
    pub fn new(cluster: Arc<dyn ClusterApi>, router: OwnershipRouter) -> Self {
        Self {
            cluster,
            router,
            entries: Mutex::new(HashMap::new()),
            resync_period: DEFAULT_RESYNC_PERIOD,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Makes sure a watch for `identity` is running and has finished its
    /// initial listing. Concurrent callers for the same key share one watch.
    pub async fn ensure_watch(&self, identity: &ResourceIdentity, namespace: Option<&str>) -> Result<()> {
        let key = WatchKey {
            identity: identity.clone(),
            namespace: namespace.map(String::from),
        };
        let entry = self.entry(key);

        match tokio::time::timeout(self.sync_timeout, entry.reader.wait_until_ready()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Other(format!("watch for {} stopped before syncing", identity))),
            Err(_) => Err(Error::SyncTimeout {
                identity: identity.to_string(),
                timeout: self.sync_timeout,
            }),
        }
    }

    fn entry(&self, key: WatchKey) -> Arc<WatchEntry> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            if !entry.task.is_finished() {
                return Arc::clone(entry);
            }
            warn!("Watch for {} has stopped, restarting it", key.identity);
        }

        info!(
            "Starting watch for {} in {}",
            key.identity,
            key.namespace.as_deref().unwrap_or("all namespaces")
        );
        let writer = Writer::new(key.identity.api_resource());
        let reader = writer.as_reader();
        let worker = WatchWorker {
            cluster: Arc::clone(&self.cluster),
            router: self.router.clone(),
            key: key.clone(),
            resync_period: self.resync_period,
            reader: reader.clone(),
        };
        let entry = Arc::new(WatchEntry {
            reader,
            task: tokio::spawn(worker.run(writer)),
        });
        entries.insert(key, Arc::clone(&entry));
        metrics::gauge!(names::WATCH_REGISTRY_ENTRIES).set(entries.len() as f64);
        entry
    }

    pub fn contains(&self, identity: &ResourceIdentity, namespace: Option<&str>) -> bool {
        let key = WatchKey {
            identity: identity.clone(),
            namespace: namespace.map(String::from),
        };
        self.entries.lock().contains_key(&key)
    }

    pub fn is_synced(&self, identity: &ResourceIdentity, namespace: Option<&str>) -> bool {
        let key = WatchKey {
            identity: identity.clone(),
            namespace: namespace.map(String::from),
        };
        self.entries
            .lock()
            .get(&key)
            .is_some_and(|entry| matches!(entry.reader.wait_until_ready().now_or_never(), Some(Ok(()))))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let entries: Vec<_> = self.entries.lock().drain().collect();
        for (key, entry) in entries {
            debug!("Stopping watch for {}", key.identity);
            entry.task.abort();
        }
        metrics::gauge!(names::WATCH_REGISTRY_ENTRIES).set(0.0);
    }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        for entry in self.entries.get_mut().values() {
            entry.task.abort();
        }
    }
}

type ObjectKey = (Option<String>, String);

fn object_key(object: &DynamicObject) -> ObjectKey {
    (object.namespace(), object.name_any())
}

struct WatchWorker {
    cluster: Arc<dyn ClusterApi>,
    router: OwnershipRouter,
    key: WatchKey,
    resync_period: Duration,
    reader: Store<DynamicObject>,
}

impl WatchWorker {
    async fn run(self, writer: Writer<DynamicObject>) {
        let watch = self
            .cluster
            .watch(&self.key.identity, self.key.namespace.as_deref());
        let mut stream = reflector::reflector(writer, watch).boxed();
        // What the store held when the current listing began.
        let mut before_relist: HashMap<ObjectKey, Arc<DynamicObject>> = HashMap::new();

        let mut resync = tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    let cached = self.reader.state();
                    debug!("Resyncing {} cached {}", cached.len(), self.key.identity);
                    for object in &cached {
                        self.router.route(ChildEvent::Resync, object).await;
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(WatchEvent::Init)) => {
                        before_relist = self
                            .reader
                            .state()
                            .into_iter()
                            .map(|object| (object_key(&object), object))
                            .collect();
                    }
                    Some(Ok(WatchEvent::InitApply(_))) => {}
                    Some(Ok(WatchEvent::InitDone)) => {
                        self.route_relist(std::mem::take(&mut before_relist)).await;
                    }
                    Some(Ok(WatchEvent::Apply(object))) => {
                        self.router.route(ChildEvent::Applied, &object).await;
                    }
                    Some(Ok(WatchEvent::Delete(object))) => {
                        self.router.route(ChildEvent::Deleted, &object).await;
                    }
                    Some(Err(e)) => {
                        warn!("Watch for {} failed: {}", self.key.identity, e);
                    }
                    None => {
                        warn!("Watch stream for {} ended", self.key.identity);
                        break;
                    }
                }
            }
        }
    }

    /// Routes the difference between the store before a listing and the store
    /// the listing produced. Objects with an unchanged resource version are
    /// skipped.
    async fn route_relist(&self, mut before: HashMap<ObjectKey, Arc<DynamicObject>>) {
        for object in self.reader.state() {
            match before.remove(&object_key(&object)) {
                Some(old) if old.resource_version() == object.resource_version() => {}
                _ => {
                    self.router.route(ChildEvent::Applied, &object).await;
                }
            }
        }
        for object in before.values() {
            self.router.route(ChildEvent::Deleted, object).await;
        }
    }
}
