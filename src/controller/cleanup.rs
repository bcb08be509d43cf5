//! Deletion handling for terminating policies
//!
//! Each enactment of a terminating policy walks
//! `Active -> PendingDelete -> Removed`. The controller only drives the first
//! step (issuing delete); the node agent drives the second by releasing the
//! node finalizer. The policy finalizer is removed once nothing referencing
//! the policy is left, and until then the policy is polled at a pace chosen
//! by whether any remaining node can currently answer.

use futures::future::join_all;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::context::Context;
use super::policy::has_finalizer;
use super::status;
use crate::crd::{Enactment, Policy};
use crate::liveness::{LivenessSnapshot, NodeLiveness};
use crate::store::{DeleteOutcome, EnactmentSelector};
use crate::{Error, POLICY_FINALIZER};

/// Lifecycle position of one enactment of a terminating policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionState {
    /// Present without a deletion timestamp
    Active,
    /// Deletion recorded, waiting for the node to release it
    PendingDelete,
    /// No longer in the store
    Removed,
}

impl DeletionState {
    /// Classify an enactment as last read from the store
    pub fn of(enactment: Option<&Enactment>) -> Self {
        match enactment {
            None => Self::Removed,
            Some(e) if e.is_terminating() => Self::PendingDelete,
            Some(_) => Self::Active,
        }
    }
}

/// Drive a terminating policy towards removal
pub async fn handle_deletion(policy: &Policy, ctx: &Context) -> Result<Action, Error> {
    let name = policy.name_any();

    if !has_finalizer(policy) {
        debug!("Policy terminating without our finalizer");
        return Ok(Action::await_change());
    }

    // Without a node list every remaining node counts as unreachable
    let liveness = match ctx.nodes.list_nodes().await {
        Ok(nodes) => LivenessSnapshot::from_nodes(&nodes),
        Err(e) => {
            warn!(error = %e, "Could not list nodes, treating all as unreachable");
            LivenessSnapshot::default()
        }
    };

    let enactments = ctx
        .enactments
        .list(&EnactmentSelector::Policy(name.clone()))
        .await?;

    let (active, mut remaining): (Vec<Enactment>, Vec<Enactment>) = enactments
        .into_iter()
        .partition(|e| DeletionState::of(Some(e)) == DeletionState::Active);

    let results = join_all(active.iter().map(|e| {
        let key = e.key();
        async move { (key.clone(), ctx.enactments.delete(&key).await) }
    }))
    .await;

    let mut first_error: Option<Error> = None;
    for (enactment, (key, result)) in active.into_iter().zip(results) {
        match result {
            Ok(DeleteOutcome::Gone) => info!(enactment = %key, "Enactment removed"),
            Ok(DeleteOutcome::Pending) => {
                info!(
                    enactment = %key,
                    reachable = liveness.is_reachable(&key.node),
                    "Enactment waiting for node release"
                );
                remaining.push(enactment);
            }
            Err(e) => {
                warn!(enactment = %key, error = %e, "Failed to delete enactment");
                remaining.push(enactment);
                first_error.get_or_insert(e);
            }
        }
    }

    if remaining.is_empty() && first_error.is_none() {
        info!("All enactments removed, releasing policy");
        ctx.policies.remove_finalizer(policy, POLICY_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let any_reachable = remaining
        .iter()
        .any(|e| liveness.is_reachable(&e.spec.node_name));

    let new_status = status::terminating(policy, &remaining, &liveness);
    if status::needs_update(policy, &new_status) {
        if let Err(e) = ctx.policies.patch_status(&name, &new_status).await {
            warn!(error = %e, "Failed to report terminating status");
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    let poll = ctx.config.deletion_poll_interval(any_reachable);
    debug!(
        remaining = remaining.len(),
        any_reachable,
        requeue_in = ?poll,
        "Policy still has enactments"
    );
    Ok(Action::requeue(poll))
}
