//! In-process cluster backend.
//!
//! Objects live in a map keyed by identity, namespace and name. Every
//! successful create or delete is pushed to the watch streams subscribed to
//! that identity, so the registry and router see the same event flow they
//! would against an API server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::watcher;
use kube::ResourceExt;
use parking_lot::Mutex;

use crate::cluster::{ClusterApi, WatchEvent, WatchStream};
use crate::crd::{CharlesDeployment, ReconcileKey};
use crate::error::{Error, Result};
use crate::identity::ResourceIdentity;

type ObjectKey = (ResourceIdentity, Option<String>, String);

struct Subscriber<K> {
    namespace: Option<String>,
    tx: UnboundedSender<watcher::Result<WatchEvent<K>>>,
}

impl<K: Clone> Subscriber<K> {
    fn matches(&self, namespace: Option<&str>) -> bool {
        self.namespace.is_none() || self.namespace.as_deref() == namespace
    }

    fn send(&self, event: WatchEvent<K>) -> bool {
        self.tx.unbounded_send(Ok(event)).is_ok()
    }
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, DynamicObject>,
    parents: HashMap<ReconcileKey, CharlesDeployment>,
    child_watchers: HashMap<ResourceIdentity, Vec<Subscriber<DynamicObject>>>,
    parent_watchers: Vec<Subscriber<CharlesDeployment>>,
    watches_started: HashMap<ResourceIdentity, usize>,
    creates: usize,
    gets: usize,
    next_uid: u64,
    next_version: u64,
    stale_reads: bool,
    hold_initial_sync: bool,
    create_failure: Option<String>,
}

impl State {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("00000000-0000-0000-0000-{:012}", self.next_uid)
    }

    fn resource_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn broadcast(&mut self, identity: &ResourceIdentity, namespace: Option<&str>, event: WatchEvent<DynamicObject>) {
        if let Some(subscribers) = self.child_watchers.get_mut(identity) {
            subscribers.retain(|s| !s.matches(namespace) || s.send(event.clone()));
        }
    }

    fn broadcast_parent(&mut self, namespace: Option<&str>, event: WatchEvent<CharlesDeployment>) {
        self.parent_watchers
            .retain(|s| !s.matches(namespace) || s.send(event.clone()));
    }
}

#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a parent, assigning a uid on first write.
    pub fn apply_parent(&self, mut parent: CharlesDeployment) -> CharlesDeployment {
        let mut state = self.state.lock();
        let key = parent.key();
        let existing = state.parents.get(&key).and_then(|p| p.metadata.uid.clone());
        let uid = match existing {
            Some(uid) => uid,
            None => parent.metadata.uid.clone().unwrap_or_else(|| state.uid()),
        };
        parent.metadata.uid = Some(uid);
        parent.metadata.resource_version = Some(state.resource_version());
        state.parents.insert(key.clone(), parent.clone());
        state.broadcast_parent(Some(&key.namespace), WatchEvent::Apply(parent.clone()));
        parent
    }

    pub fn delete_parent(&self, key: &ReconcileKey) -> Option<CharlesDeployment> {
        let mut state = self.state.lock();
        let removed = state.parents.remove(key)?;
        state.broadcast_parent(Some(&key.namespace), WatchEvent::Delete(removed.clone()));
        Some(removed)
    }

    /// Removes a child out-of-band, the way a user running `kubectl delete` would.
    pub fn delete(&self, identity: &ResourceIdentity, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let mut state = self.state.lock();
        let key = (identity.clone(), namespace.map(String::from), name.to_string());
        let removed = state.objects.remove(&key)?;
        state.broadcast(identity, namespace, WatchEvent::Delete(removed.clone()));
        Some(removed)
    }

    /// Removes a child without telling watchers, as if it went away while
    /// they were disconnected.
    pub fn delete_unobserved(
        &self,
        identity: &ResourceIdentity,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let key = (identity.clone(), namespace.map(String::from), name.to_string());
        self.state.lock().objects.remove(&key)
    }

    /// Makes every watch of `identity` list its objects again, the way a
    /// reconnecting watcher does.
    pub fn relist(&self, identity: &ResourceIdentity) {
        let mut state = self.state.lock();
        let State {
            objects,
            child_watchers,
            ..
        } = &mut *state;
        let Some(subscribers) = child_watchers.get_mut(identity) else {
            return;
        };
        subscribers.retain(|subscriber| {
            subscriber.send(WatchEvent::Init)
                && objects
                    .iter()
                    .filter(|((id, ns, _), _)| id == identity && subscriber.matches(ns.as_deref()))
                    .all(|(_, object)| subscriber.send(WatchEvent::InitApply(object.clone())))
                && subscriber.send(WatchEvent::InitDone)
        });
    }

    /// Rewrites a stored child, emitting an `Apply` event.
    pub fn touch(&self, identity: &ResourceIdentity, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let mut state = self.state.lock();
        let key = (identity.clone(), namespace.map(String::from), name.to_string());
        let version = state.resource_version();
        let object = state.objects.get_mut(&key)?;
        object.metadata.resource_version = Some(version);
        let object = object.clone();
        state.broadcast(identity, namespace, WatchEvent::Apply(object.clone()));
        Some(object)
    }

    pub fn object(&self, identity: &ResourceIdentity, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let key = (identity.clone(), namespace.map(String::from), name.to_string());
        self.state.lock().objects.get(&key).cloned()
    }

    pub fn objects(&self) -> Vec<DynamicObject> {
        self.state.lock().objects.values().cloned().collect()
    }

    pub fn creates(&self) -> usize {
        self.state.lock().creates
    }

    pub fn gets(&self) -> usize {
        self.state.lock().gets
    }

    pub fn watches_started(&self, identity: &ResourceIdentity) -> usize {
        self.state
            .lock()
            .watches_started
            .get(identity)
            .copied()
            .unwrap_or_default()
    }

    /// Every child `get` misses, as if served from a lagging cache.
    pub fn set_stale_reads(&self, stale: bool) {
        self.state.lock().stale_reads = stale;
    }

    /// New child watches list their objects but never report `InitDone`.
    pub fn set_hold_initial_sync(&self, hold: bool) {
        self.state.lock().hold_initial_sync = hold;
    }

    pub fn set_create_failure(&self, message: Option<&str>) {
        self.state.lock().create_failure = message.map(String::from);
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_parent(&self, key: &ReconcileKey) -> Result<Option<CharlesDeployment>> {
        Ok(self.state.lock().parents.get(key).cloned())
    }

    fn watch_parents(&self, namespace: Option<&str>) -> WatchStream<CharlesDeployment> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        let subscriber = Subscriber {
            namespace: namespace.map(String::from),
            tx,
        };
        subscriber.send(WatchEvent::Init);
        for parent in state.parents.values() {
            if subscriber.matches(parent.namespace().as_deref()) {
                subscriber.send(WatchEvent::InitApply(parent.clone()));
            }
        }
        subscriber.send(WatchEvent::InitDone);
        state.parent_watchers.push(subscriber);
        rx.boxed()
    }

    async fn get(
        &self,
        identity: &ResourceIdentity,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let mut state = self.state.lock();
        state.gets += 1;
        if state.stale_reads {
            return Ok(None);
        }
        let key = (identity.clone(), namespace.map(String::from), name.to_string());
        Ok(state.objects.get(&key).cloned())
    }

    async fn create(
        &self,
        identity: &ResourceIdentity,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        if let Some(message) = state.create_failure.clone() {
            return Err(Error::Transport(message));
        }
        let name = object
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingField("metadata.name"))?;
        let key = (identity.clone(), namespace.map(String::from), name.clone());
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{}/{}", identity, name)));
        }

        let mut created = object.clone();
        created.metadata.namespace = namespace.map(String::from);
        created.metadata.uid = Some(state.uid());
        created.metadata.resource_version = Some(state.resource_version());
        state.creates += 1;
        state.objects.insert(key, created.clone());
        state.broadcast(identity, namespace, WatchEvent::Apply(created.clone()));
        Ok(created)
    }

    fn watch(&self, identity: &ResourceIdentity, namespace: Option<&str>) -> WatchStream<DynamicObject> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        *state.watches_started.entry(identity.clone()).or_default() += 1;

        let subscriber = Subscriber {
            namespace: namespace.map(String::from),
            tx,
        };
        subscriber.send(WatchEvent::Init);
        for ((id, ns, _), object) in &state.objects {
            if id == identity && subscriber.matches(ns.as_deref()) {
                subscriber.send(WatchEvent::InitApply(object.clone()));
            }
        }
        if !state.hold_initial_sync {
            subscriber.send(WatchEvent::InitDone);
        }
        state
            .child_watchers
            .entry(identity.clone())
            .or_default()
            .push(subscriber);
        rx.boxed()
    }
}
