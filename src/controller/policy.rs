//! NodeNetworkConfigurationPolicy reconciler
//!
//! One pass reads the latest policy, a fresh node list and the enactments
//! referencing the policy, then converges the enactments and the policy
//! status. Terminating policies are handed to [`super::cleanup`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::cleanup;
use super::context::Context;
use super::desired::{self, EnactmentPlan};
use super::status;
use crate::crd::{EnactmentKey, Policy};
use crate::store::{DeleteOutcome, EnactmentSelector};
use crate::{Error, POLICY_FINALIZER};

/// Requeue delay after adding the policy finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Check if the policy carries our finalizer
pub fn has_finalizer(policy: &Policy) -> bool {
    policy.finalizers().iter().any(|f| f == POLICY_FINALIZER)
}

/// Reconcile a policy
///
/// Every pass is a full, idempotent re-derivation from the store; the
/// returned action is the requeue that keeps the policy converging.
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
pub async fn reconcile(policy: Arc<Policy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = policy.name_any();

    let action = if policy.metadata.deletion_timestamp.is_some() {
        cleanup::handle_deletion(&policy, &ctx).await?
    } else {
        reconcile_active(&policy, &ctx).await?
    };

    ctx.backoff.reset(&name);
    Ok(action)
}

/// Requeue a failed pass with per-policy exponential backoff
pub fn error_policy(policy: Arc<Policy>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = policy.name_any();
    // resending a refused request fails the same way
    let delay = if error.is_retryable() {
        ctx.backoff.next_delay(&name)
    } else {
        ctx.config.error_backoff.max_delay
    };
    error!(
        policy = %name,
        error = %error,
        failures = ctx.backoff.failures(&name),
        retry_in = ?delay,
        "Policy reconciliation failed"
    );
    Action::requeue(delay)
}

async fn reconcile_active(policy: &Policy, ctx: &Context) -> Result<Action, Error> {
    let name = policy.name_any();

    if !has_finalizer(policy) {
        info!("Adding policy finalizer");
        ctx.policies.add_finalizer(policy, POLICY_FINALIZER).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let selector = match policy.spec.node_selector(&name) {
        Ok(selector) => selector,
        Err(e) => {
            warn!(error = %e, "Invalid node selector, waiting for a spec change");
            let new_status = status::invalid_selector(policy, &e);
            if status::needs_update(policy, &new_status) {
                ctx.policies.patch_status(&name, &new_status).await?;
            }
            return Ok(Action::await_change());
        }
    };

    let nodes = ctx.nodes.list_nodes().await?;
    let current = ctx
        .enactments
        .list(&EnactmentSelector::Policy(name.clone()))
        .await?;
    let mut plan = desired::plan(policy, &selector, &nodes, &current);

    let unnamable: Vec<EnactmentKey> = plan
        .create
        .iter()
        .map(|e| e.key())
        .filter(|key| !key.name_fits())
        .collect();
    if !unnamable.is_empty() {
        warn!(
            nodes = unnamable.len(),
            "Enactment names too long, skipping those nodes"
        );
        plan.create.retain(|e| e.key().name_fits());
    }

    debug!(
        matched = plan.matched.len(),
        create = plan.create.len(),
        update = plan.update.len(),
        delete = plan.delete.len(),
        stale = plan.stale.len(),
        "Computed enactment plan"
    );

    let applied = apply_plan(ctx, &plan).await;

    let new_status = match &applied {
        Err(e) if e.is_rejected() => status::rejected(policy, &plan, e),
        _ if !unnamable.is_empty() => status::invalid_name(policy, &plan, &unnamable),
        _ => status::aggregate(policy, &plan),
    };
    if status::needs_update(policy, &new_status) {
        ctx.policies.patch_status(&name, &new_status).await?;
    }

    match applied {
        Err(e) if e.is_rejected() => {
            warn!(error = %e, "API server rejected an enactment write");
            return Ok(Action::requeue(ctx.config.resync_interval));
        }
        other => other?,
    }

    if plan.is_converged() {
        Ok(Action::requeue(ctx.config.resync_interval))
    } else {
        Ok(Action::requeue(ctx.config.fast_poll_interval))
    }
}

/// Issue every write in the plan concurrently
///
/// All operations run even if some fail; the first failure is returned so
/// the pass is retried with backoff.
pub(crate) async fn apply_plan(ctx: &Context, plan: &EnactmentPlan) -> Result<(), Error> {
    let creates = join_all(plan.create.iter().map(|enactment| async move {
        match ctx.enactments.create(enactment).await {
            Ok(_) => {
                info!(enactment = %enactment.name_any(), "Created enactment");
                Ok(())
            }
            // Someone else created it; the next pass reads it
            Err(e) if e.is_conflict() => {
                debug!(enactment = %enactment.name_any(), "Enactment already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }));

    let updates = join_all(plan.update.iter().map(|enactment| async move {
        ctx.enactments.update(enactment).await?;
        info!(
            enactment = %enactment.name_any(),
            generation = enactment.spec.policy_generation,
            "Updated enactment"
        );
        Ok::<(), Error>(())
    }));

    let deletes = join_all(plan.delete.iter().map(|key| async move {
        match ctx.enactments.delete(key).await? {
            DeleteOutcome::Gone => info!(enactment = %key, "Deleted enactment"),
            DeleteOutcome::Pending => {
                info!(enactment = %key, "Enactment deletion waiting for node release")
            }
        }
        Ok::<(), Error>(())
    }));

    let (creates, updates, deletes) = futures::join!(creates, updates, deletes);

    let mut first_error: Option<Error> = None;
    for result in creates.into_iter().chain(updates).chain(deletes) {
        if let Err(e) = result {
            warn!(error = %e, "Enactment write failed");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
