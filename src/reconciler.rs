use std::fmt;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::creator::{self, CreateOutcome};
use crate::crd::ReconcileKey;
use crate::error::Result;
use crate::identity::ResourceIdentity;
use crate::registry::WatchRegistry;
use crate::render::Renderer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Fetched,
    Rendering,
    Creating,
    WatchEnsuring,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Fetched => "fetched",
            SyncPhase::Rendering => "rendering",
            SyncPhase::Creating => "creating",
            SyncPhase::WatchEnsuring => "watch-ensuring",
            SyncPhase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub components: usize,
    pub created: usize,
    pub existing: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The parent no longer exists; nothing to converge.
    ParentGone,
    Converged(SyncReport),
}

/// A failed sync, tagged with the phase it stopped in.
#[derive(Debug)]
pub struct SyncError {
    pub phase: SyncPhase,
    pub error: crate::Error,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

trait PhaseExt<T> {
    fn during(self, phase: SyncPhase) -> std::result::Result<T, SyncError>;
}

impl<T> PhaseExt<T> for Result<T> {
    fn during(self, phase: SyncPhase) -> std::result::Result<T, SyncError> {
        self.map_err(|error| SyncError { phase, error })
    }
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    renderer: Arc<dyn Renderer>,
    registry: Arc<WatchRegistry>,
    watch_namespace: Option<String>,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, renderer: Arc<dyn Renderer>, registry: Arc<WatchRegistry>) -> Self {
        Self {
            cluster,
            renderer,
            registry,
            watch_namespace: None,
        }
    }

    /// Restricts child watches to one namespace instead of the whole cluster.
    pub fn watch_namespace(mut self, namespace: Option<String>) -> Self {
        self.watch_namespace = namespace;
        self
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Renders every component of the parent and creates whatever children are
    /// missing. Stops at the first failure; the whole sync is replayed on retry.
    pub async fn sync(&self, key: &ReconcileKey) -> std::result::Result<SyncOutcome, SyncError> {
        let Some(parent) = self.cluster.get_parent(key).await.during(SyncPhase::Fetched)? else {
            debug!("{} no longer exists", key);
            return Ok(SyncOutcome::ParentGone);
        };
        info!("Reconciling {} ({} components)", key, parent.spec.components.len());

        let owner = creator::owner_reference(&parent).during(SyncPhase::Fetched)?;
        let namespace = parent.namespace().unwrap_or_else(|| key.namespace.clone());
        let mut report = SyncReport {
            components: parent.spec.components.len(),
            ..SyncReport::default()
        };

        for component in &parent.spec.components {
            debug!("Rendering component {} of {} from {}", component.name, key, component.chart);
            let manifests = self
                .renderer
                .render(&component.chart)
                .await
                .during(SyncPhase::Rendering)?;

            for mut manifest in manifests {
                if manifest.metadata.namespace.is_none() {
                    manifest.metadata.namespace = Some(namespace.clone());
                }
                let identity = ResourceIdentity::of(&manifest).during(SyncPhase::Creating)?;

                match creator::create_if_absent(self.cluster.as_ref(), manifest, &owner)
                    .await
                    .during(SyncPhase::Creating)?
                {
                    CreateOutcome::Created => report.created += 1,
                    CreateOutcome::AlreadyExists => report.existing += 1,
                }

                self.registry
                    .ensure_watch(&identity, self.watch_namespace.as_deref())
                    .await
                    .during(SyncPhase::WatchEnsuring)?;
            }
        }

        info!(
            "Reconciled {}: {} created, {} already present ({})",
            key,
            report.created,
            report.existing,
            SyncPhase::Done
        );
        Ok(SyncOutcome::Converged(report))
    }
}

impl SyncError {
    pub(crate) fn log(&self, key: &ReconcileKey) {
        warn!("Reconciling {} failed while {}: {}", key, self.phase, self.error);
    }
}
