//! Leader election using Kubernetes Leases
//!
//! When several controller replicas run, only the lease holder reconciles
//! policies and sweeps orphans. Nothing the controller keeps in memory is
//! authoritative, so a new leader simply starts from the store.
//!
//! # Atomicity
//!
//! Every lease write carries the resourceVersion that was read. If the lease
//! changed in between, the write fails with 409 Conflict and the attempt
//! counts as not acquired, so two replicas can never both believe they lead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::classify_kube_error;
use crate::{Error, FIELD_MANAGER};

/// Lease name for controller leader election
pub const LEADER_LEASE_NAME: &str = "nodenet-controller-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What to do with the lease as last read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease exists yet
    Create,
    /// We hold it; extend it
    Renew,
    /// The holder let it expire; take it over
    TakeOver {
        /// Transition count to record
        transitions: i32,
    },
    /// Someone else holds a live lease
    HeldByOther {
        /// Current holder identity
        holder: String,
    },
}

/// Decide how `identity` should treat `lease` at `now`
pub fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseDecision::Renew;
    }

    let expired = match (
        spec.and_then(|s| s.renew_time.as_ref()),
        spec.and_then(|s| s.lease_duration_seconds),
    ) {
        (Some(renewed), Some(duration)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    };

    match holder {
        Some(holder) if !expired => LeaseDecision::HeldByOther {
            holder: holder.to_string(),
        },
        _ => LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        },
    }
}

/// Leader elector using a namespaced Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector with the default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Block until leadership is acquired, then return a guard that renews it
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => debug!(identity = %self.identity, "Lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, error = %e, "Failed to acquire lease"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move { elector.renewal_loop(lost_tx).await });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// One compare-and-swap round; `Ok(false)` means someone else leads
    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.api();
        let now = Utc::now();
        let existing = api
            .get_opt(&self.lease_name)
            .await
            .map_err(|e| classify_kube_error("get lease", e))?;

        let mut lease = existing.clone().unwrap_or_else(|| Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: None,
        });

        let result = match decide(existing.as_ref(), &self.identity, now) {
            LeaseDecision::HeldByOther { holder } => {
                debug!(%holder, "Lease is live");
                return Ok(false);
            }
            LeaseDecision::Create => {
                lease.spec = Some(self.fresh_spec(now, 0));
                api.create(&PostParams::default(), &lease).await
            }
            LeaseDecision::Renew => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.renew_time = Some(MicroTime(now));
                api.replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
            LeaseDecision::TakeOver { transitions } => {
                info!(identity = %self.identity, transitions, "Taking over expired lease");
                lease.spec = Some(self.fresh_spec(now, transitions));
                api.replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
        };

        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease changed under us");
                Ok(false)
            }
            Err(e) => Err(classify_kube_error("write lease", e)),
        }
    }

    fn fresh_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), Error> {
        let api = self.api();
        let Some(lease) = api
            .get_opt(&self.lease_name)
            .await
            .map_err(|e| classify_kube_error("get lease", e))?
        else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": { "holderIdentity": null, "renewTime": past.to_rfc3339() },
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| classify_kube_error("release lease", e))?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Held while this replica leads; renewal runs in the background
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Give up leadership; call during graceful shutdown
    pub async fn release_leadership(&self) -> Result<(), Error> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}
