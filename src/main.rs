use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kube::CustomResourceExt;
use tracing::{error, info};

use charles_operator::fetch::GithubFetcher;
use charles_operator::leader::{LeaseConfig, LeaseLock};
use charles_operator::probes::{self, HealthState};
use charles_operator::render::{FetchingRenderer, KustomizeRenderer};
use charles_operator::shutdown::{self, GracefulShutdown, ShutdownCoordinator};
use charles_operator::telemetry;
use charles_operator::{CharlesDeployment, Error, KubeCluster, Operator, OperatorConfig, Result};

#[tokio::main]
async fn main() -> ExitCode {
    let config = OperatorConfig::parse();

    if config.print_crd {
        return match serde_yaml::to_string(&CharlesDeployment::crd()) {
            Ok(yaml) => {
                print!("{}", yaml);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = telemetry::init_tracing(config.log_json) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Operator failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: OperatorConfig) -> Result<()> {
    telemetry::init_metrics()?;

    let shutdown = GracefulShutdown::new();
    shutdown.start_signal_handler();

    let cluster = KubeCluster::try_default().await?;
    let client = cluster.client().clone();

    let renderer = FetchingRenderer::new(
        KustomizeRenderer::new(&config.kustomize_bin),
        Arc::new(GithubFetcher::new(config.github_token.clone())),
        &config.source_cache_dir,
    );
    let operator = Operator::new(Arc::new(cluster), Arc::new(renderer))
        .workers(config.workers)
        .resync_period(config.resync_period)
        .sync_timeout(config.sync_timeout)
        .backoff(config.backoff_base, config.backoff_max)
        .watch_namespace(config.watch_namespace.clone());

    let mut health = HealthState::new();
    let lease = if config.leader_elect {
        let lock = LeaseLock::new(
            client,
            LeaseConfig::new(
                &config.leader_election_id,
                config.lease_namespace(),
                LeaseConfig::default_identity(),
            ),
        );
        health = health.with_leader(lock.election().guard());
        Some(lock)
    } else {
        None
    };

    let metrics_server = tokio::spawn(probes::serve(
        config.metrics_bind_address,
        probes::metrics_router(),
        shutdown.subscribe(),
    ));
    let health_server = tokio::spawn(probes::serve(
        config.health_probe_bind_address,
        probes::health_router(health.clone()),
        shutdown.subscribe(),
    ));
    health.set_ready(true);

    let control_loop = async {
        let result = match lease {
            Some(lock) => run_as_leader(lock, operator, shutdown.coordinator()).await,
            None => operator.run(shutdown.subscribe()).await,
        };
        health.set_ready(false);
        result
    };
    let result = shutdown::supervise(
        control_loop,
        vec![("metrics server", metrics_server), ("health server", health_server)],
        shutdown.coordinator(),
    )
    .await;

    info!("Shutdown complete");
    result
}

async fn run_as_leader(lock: LeaseLock, operator: Operator, coordinator: &Arc<ShutdownCoordinator>) -> Result<()> {
    let mut guard = lock.election().guard();
    let lease_task = tokio::spawn(lock.run(coordinator.subscribe()));

    let leading = tokio::select! {
        leading = guard.wait_for_leadership() => leading,
        _ = shutdown::wait_for(coordinator.subscribe()) => false,
    };

    let operator_task = leading.then(|| tokio::spawn(operator.run(coordinator.subscribe())));

    let lease_result = lease_task
        .await
        .map_err(|e| Error::Other(format!("lease task failed: {}", e)))
        .and_then(|r| r);
    coordinator.initiate_shutdown();

    let operator_result = match operator_task {
        Some(task) => task
            .await
            .map_err(|e| Error::Other(format!("operator task failed: {}", e)))
            .and_then(|r| r),
        None => Ok(()),
    };

    lease_result.and(operator_result)
}
