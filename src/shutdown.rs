use std::future::Future;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::error::{Error, Result};

pub struct ShutdownCoordinator {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn initiate_shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Initiating graceful shutdown");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `shutdown` flips to `true` or its sender goes away.
pub async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Runs `main` next to long-lived service tasks such as the HTTP servers.
///
/// A service that fails, or returns before shutdown was requested, starts
/// shutdown so `main` winds down, and its error is returned. An error from
/// `main` itself takes precedence.
pub async fn supervise<F>(
    main: F,
    services: Vec<(&'static str, JoinHandle<Result<()>>)>,
    coordinator: &ShutdownCoordinator,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let mut services: FuturesUnordered<_> = services
        .into_iter()
        .map(|(name, handle)| async move { (name, handle.await) })
        .collect();
    let mut failure = None;
    tokio::pin!(main);

    let result = loop {
        tokio::select! {
            result = &mut main => break result,
            Some((name, outcome)) = services.next() => {
                if let Some(e) = service_failure(name, outcome, coordinator) {
                    error!("{} failed: {}", name, e);
                    failure.get_or_insert(e);
                    coordinator.initiate_shutdown();
                }
            }
        }
    };

    coordinator.initiate_shutdown();
    while let Some((name, outcome)) = services.next().await {
        if let Some(e) = service_failure(name, outcome, coordinator) {
            error!("{} failed: {}", name, e);
            failure.get_or_insert(e);
        }
    }

    result.and(failure.map_or(Ok(()), Err))
}

fn service_failure(
    name: &str,
    outcome: std::result::Result<Result<()>, JoinError>,
    coordinator: &ShutdownCoordinator,
) -> Option<Error> {
    match outcome {
        Ok(Ok(())) if coordinator.is_shutdown() => None,
        Ok(Ok(())) => Some(Error::Other(format!("{} stopped before shutdown", name))),
        Ok(Err(e)) => Some(e),
        Err(e) => Some(Error::Other(format!("{} task failed: {}", name, e))),
    }
}

pub async fn run_signal_handler(coordinator: Arc<ShutdownCoordinator>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    coordinator.initiate_shutdown();
}

pub struct GracefulShutdown {
    coordinator: Arc<ShutdownCoordinator>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            coordinator: Arc::new(ShutdownCoordinator::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    pub fn start_signal_handler(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            run_signal_handler(coordinator).await;
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.coordinator.subscribe()
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
