use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const RECONCILE_TOTAL: &str = "charles_reconcile_total";
    pub const RECONCILE_DURATION_SECONDS: &str = "charles_reconcile_duration_seconds";
    pub const CHILDREN_CREATED_TOTAL: &str = "charles_children_created_total";
    pub const ROUTER_ENQUEUED_TOTAL: &str = "charles_router_enqueued_total";
    pub const WORKQUEUE_RETRIES_TOTAL: &str = "charles_workqueue_retries_total";
    pub const WORKQUEUE_DEPTH: &str = "charles_workqueue_depth";
    pub const WATCH_REGISTRY_ENTRIES: &str = "charles_watch_registry_entries";
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    installed.map_err(|e| Error::Configuration(format!("cannot install tracing subscriber: {}", e)))
}

/// Installs the Prometheus recorder. Returns `false` if one was already set.
pub fn init_metrics() -> Result<bool> {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus recorder already installed");
        return Ok(false);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Configuration(format!("cannot install Prometheus recorder: {}", e)))?;
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        return Ok(false);
    }
    tracing::info!("Prometheus metrics initialized");
    Ok(true)
}

/// Renders all metrics in Prometheus text format, or `None` before
/// [`init_metrics`] has run.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}
