use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono::{self, Utc};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub struct LeaderGuard {
    role_rx: watch::Receiver<bool>,
}

impl LeaderGuard {
    pub fn new(role_rx: watch::Receiver<bool>) -> Self {
        Self { role_rx }
    }

    pub fn is_leader(&self) -> bool {
        *self.role_rx.borrow()
    }

    /// Resolves once this process holds the lease. Returns `false` if the
    /// election was dropped first.
    pub async fn wait_for_leadership(&mut self) -> bool {
        loop {
            if *self.role_rx.borrow_and_update() {
                return true;
            }
            if self.role_rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

impl Clone for LeaderGuard {
    fn clone(&self) -> Self {
        Self {
            role_rx: self.role_rx.clone(),
        }
    }
}

pub struct LeaderElection {
    role_tx: watch::Sender<bool>,
    role_rx: watch::Receiver<bool>,
}

impl LeaderElection {
    pub fn new() -> Self {
        let (role_tx, role_rx) = watch::channel(false);
        Self { role_tx, role_rx }
    }

    pub fn set_leader(&self, leader: bool) {
        let previous = self.role_tx.send_replace(leader);
        match (previous, leader) {
            (false, true) => info!("This instance is now the leader"),
            (true, false) => warn!("This instance is no longer the leader"),
            _ => {}
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.role_rx.borrow()
    }

    pub fn guard(&self) -> LeaderGuard {
        LeaderGuard::new(self.role_rx.clone())
    }
}

impl Default for LeaderElection {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    pub fn default_identity() -> String {
        std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "charles-operator".to_string())
    }
}

/// Holds a `coordination.k8s.io/v1` Lease on behalf of this process.
pub struct LeaseLock {
    api: Api<Lease>,
    config: LeaseConfig,
    election: Arc<LeaderElection>,
}

impl LeaseLock {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        let api = Api::namespaced(client, &config.namespace);
        Self {
            api,
            config,
            election: Arc::new(LeaderElection::new()),
        }
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let duration_secs = i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX);

        let Some(mut lease) = self.api.get_opt(&self.config.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.name.clone()),
                    namespace: Some(self.config.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: Some(duration_secs),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(Error::Kube(e)),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.config.identity.as_str());
        let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(MicroTime(renewed)), Some(secs)) => {
                *renewed + chrono::Duration::seconds(i64::from(secs)) < now
            }
            _ => true,
        };
        if !held_by_us && !expired {
            debug!(
                "Lease {} is held by {}",
                self.config.name,
                spec.holder_identity.as_deref().unwrap_or_default()
            );
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or_default();
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(duration_secs),
            acquire_time: if held_by_us { spec.acquire_time } else { Some(MicroTime(now)) },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if held_by_us { transitions } else { transitions.saturating_add(1) }),
            ..Default::default()
        });

        match self.api.replace(&self.config.name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    /// Keeps acquiring or renewing the lease until shutdown. Fails when
    /// leadership, once held, cannot be renewed within the renew deadline.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Waiting for lease {}/{} as {}",
            self.config.namespace, self.config.name, self.config.identity
        );
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_renew = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            }

            let was_leader = self.election.is_leader();
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renew = tokio::time::Instant::now();
                    self.election.set_leader(true);
                }
                Ok(false) if was_leader => {
                    self.election.set_leader(false);
                    return Err(Error::Other(format!("lease {} was taken over", self.config.name)));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Error renewing lease {}: {}", self.config.name, e);
                    if was_leader && last_renew.elapsed() > self.config.renew_deadline {
                        self.election.set_leader(false);
                        return Err(Error::Other(format!(
                            "could not renew lease {} within {:?}",
                            self.config.name, self.config.renew_deadline
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_resolves_when_leadership_is_granted() {
        let election = LeaderElection::new();
        let mut guard = election.guard();
        assert!(!guard.is_leader());

        let waiter = tokio::spawn(async move { guard.wait_for_leadership().await });
        election.set_leader(true);

        assert!(waiter.await.unwrap());
        assert!(election.is_leader());
    }

    #[tokio::test]
    async fn guard_gives_up_when_election_is_dropped() {
        let election = LeaderElection::new();
        let mut guard = election.guard();
        drop(election);
        assert!(!guard.wait_for_leadership().await);
    }
}
