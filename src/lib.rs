pub mod cluster;
pub mod config;
pub mod creator;
pub mod crd;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod leader;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod operator;
pub mod probes;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod render;
pub mod router;
pub mod shutdown;
pub mod telemetry;

pub use cluster::{ClusterApi, KubeCluster, WatchEvent};
pub use config::OperatorConfig;
pub use creator::CreateOutcome;
pub use crd::{CharlesDeployment, CharlesDeploymentSpec, Component, ReconcileKey};
pub use error::{Error, Result};
pub use fetch::{GithubFetcher, SourceFetcher};
pub use identity::ResourceIdentity;
pub use leader::{LeaderElection, LeaderGuard, LeaseConfig, LeaseLock};
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryCluster;
pub use operator::{Engine, Operator};
pub use queue::WorkQueue;
pub use reconciler::{Reconciler, SyncError, SyncOutcome, SyncPhase, SyncReport};
pub use registry::WatchRegistry;
pub use render::{FetchingRenderer, KustomizeRenderer, Renderer};
pub use router::{ChildEvent, OwnershipRouter, ParentCache};
pub use shutdown::{GracefulShutdown, ShutdownCoordinator};

pub mod prelude {
    pub use crate::cluster::{ClusterApi, KubeCluster};
    pub use crate::crd::{CharlesDeployment, CharlesDeploymentSpec, Component, ReconcileKey};
    pub use crate::error::{Error, Result};
    pub use crate::operator::Operator;
    pub use crate::render::Renderer;

    pub use kube::api::DynamicObject;
    pub use kube::CustomResource;
    pub use schemars::JsonSchema;
    pub use serde::{Deserialize, Serialize};

    pub use std::sync::Arc;
    pub use std::time::Duration;
}
