use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::operator::DEFAULT_WORKERS;

#[derive(Parser, Debug, Clone)]
#[command(name = "charles-operator", version, about = "Keeps CharlesDeployment children converged")]
pub struct OperatorConfig {
    /// Address the Prometheus endpoint binds to.
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Address the liveness and readiness probes bind to.
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Only reconcile while holding the leader lease.
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    #[arg(long, env = "LEADER_ELECTION_ID", default_value = "charles-operator-leader")]
    pub leader_election_id: String,

    /// Defaults to the pod namespace, then `default`.
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    pub leader_election_namespace: Option<String>,

    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    #[arg(long, env = "RESYNC_PERIOD", default_value = "60s", value_parser = humantime::parse_duration)]
    pub resync_period: Duration,

    #[arg(long, env = "SYNC_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub sync_timeout: Duration,

    #[arg(long, env = "BACKOFF_BASE", default_value = "5ms", value_parser = humantime::parse_duration)]
    pub backoff_base: Duration,

    #[arg(long, env = "BACKOFF_MAX", default_value = "1000s", value_parser = humantime::parse_duration)]
    pub backoff_max: Duration,

    /// Watch parents and children in this namespace only.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[arg(long, env = "KUSTOMIZE_BIN", default_value = "kustomize")]
    pub kustomize_bin: PathBuf,

    /// Where remote template sources are checked out.
    #[arg(long, env = "SOURCE_CACHE_DIR", default_value = "/tmp/charles-sources")]
    pub source_cache_dir: PathBuf,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Print the CharlesDeployment CRD as YAML and exit.
    #[arg(long)]
    pub print_crd: bool,
}

impl OperatorConfig {
    pub fn lease_namespace(&self) -> String {
        self.leader_election_namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .unwrap_or_else(|| "default".to_string())
    }
}
