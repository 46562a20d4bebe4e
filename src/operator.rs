use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, WatchEvent};
use crate::crd::ReconcileKey;
use crate::error::Result;
use crate::queue::{WorkQueue, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::reconciler::{Reconciler, SyncOutcome};
use crate::registry::{WatchRegistry, DEFAULT_RESYNC_PERIOD, DEFAULT_SYNC_TIMEOUT};
use crate::render::Renderer;
use crate::router::{OwnershipRouter, ParentCache};
use crate::telemetry::names;

pub const DEFAULT_WORKERS: usize = 2;

pub struct Operator {
    cluster: Arc<dyn ClusterApi>,
    renderer: Arc<dyn Renderer>,
    workers: usize,
    resync_period: Duration,
    sync_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    watch_namespace: Option<String>,
}

impl Operator {
    pub fn new(cluster: Arc<dyn ClusterApi>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            cluster,
            renderer,
            workers: DEFAULT_WORKERS,
            resync_period: DEFAULT_RESYNC_PERIOD,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            backoff_base: DEFAULT_BASE_DELAY,
            backoff_max: DEFAULT_MAX_DELAY,
            watch_namespace: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn watch_namespace(mut self, namespace: Option<String>) -> Self {
        self.watch_namespace = namespace;
        self
    }

    pub fn build(self) -> Engine {
        let queue = WorkQueue::with_backoff(self.backoff_base, self.backoff_max);
        let parents = ParentCache::new();
        let router = OwnershipRouter::new(Arc::clone(&self.cluster), queue.clone(), parents.clone());
        let registry = Arc::new(
            WatchRegistry::new(Arc::clone(&self.cluster), router)
                .resync_period(self.resync_period)
                .sync_timeout(self.sync_timeout),
        );
        let reconciler = Reconciler::new(Arc::clone(&self.cluster), self.renderer, Arc::clone(&registry))
            .watch_namespace(self.watch_namespace.clone());

        Engine {
            cluster: self.cluster,
            queue,
            parents,
            registry,
            reconciler: Arc::new(reconciler),
            workers: self.workers,
            watch_namespace: self.watch_namespace,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.build().run(shutdown).await
    }
}

/// The assembled control loop: queue, parent watch, child registry and workers.
#[derive(Clone)]
pub struct Engine {
    cluster: Arc<dyn ClusterApi>,
    queue: WorkQueue<ReconcileKey>,
    parents: ParentCache,
    registry: Arc<WatchRegistry>,
    reconciler: Arc<Reconciler>,
    workers: usize,
    watch_namespace: Option<String>,
}

impl Engine {
    pub fn queue(&self) -> &WorkQueue<ReconcileKey> {
        &self.queue
    }

    pub fn parents(&self) -> &ParentCache {
        &self.parents
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Runs one `next → sync → done` cycle. Returns `false` once the queue
    /// has been shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.next().await else {
            return false;
        };

        let started = Instant::now();
        match self.reconciler.sync(&key).await {
            Ok(outcome) => {
                if let SyncOutcome::ParentGone = outcome {
                    debug!("Dropping {} from the queue", key);
                }
                self.queue.forget(&key);
                metrics::counter!(names::RECONCILE_TOTAL, "result" => "success").increment(1);
            }
            Err(e) => {
                e.log(&key);
                metrics::counter!(names::RECONCILE_TOTAL, "result" => e.error.kind()).increment(1);
                self.queue.retry(key.clone());
            }
        }
        metrics::histogram!(names::RECONCILE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        self.queue.done(&key);
        true
    }

    pub fn spawn_parent_watch(&self) -> JoinHandle<()> {
        let mut stream = self.cluster.watch_parents(self.watch_namespace.as_deref());
        let queue = self.queue.clone();
        let parents = self.parents.clone();

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(WatchEvent::InitApply(parent)) | Ok(WatchEvent::Apply(parent)) => {
                        parents.observe(&parent);
                        queue.add(parent.key());
                    }
                    Ok(WatchEvent::Delete(parent)) => {
                        parents.forget(&parent);
                        queue.add(parent.key());
                    }
                    Ok(WatchEvent::Init) | Ok(WatchEvent::InitDone) => {}
                    Err(e) => warn!("Parent watch failed: {}", e),
                }
            }
            warn!("Parent watch ended");
        })
    }

    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|id| {
                let engine = self.clone();
                tokio::spawn(async move {
                    debug!("Worker {} started", id);
                    while engine.process_next().await {}
                    debug!("Worker {} stopped", id);
                })
            })
            .collect()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting operator with {} workers in {}",
            self.workers,
            self.watch_namespace.as_deref().unwrap_or("all namespaces")
        );

        let parent_watch = self.spawn_parent_watch();
        let workers = self.spawn_workers();

        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Stopping operator");
        self.queue.shut_down();
        parent_watch.abort();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker exited abnormally: {}", e);
            }
        }
        self.registry.shutdown();
        info!("Operator stopped");
        Ok(())
    }
}
