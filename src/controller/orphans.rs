//! Orphaned enactment sweeper
//!
//! Enactments can outlive their policy when the policy finalizer is removed
//! by hand, or when a policy was deleted while no controller was running.
//! The sweeper periodically lists every enactment and requests deletion of
//! those whose policy no longer exists. Removal still waits for the node
//! release like any other deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::context::Context;
use crate::crd::EnactmentKey;
use crate::store::{DeleteOutcome, EnactmentSelector};
use crate::Error;

/// Delete active enactments whose policy is gone
///
/// Returns the number of delete requests that succeeded. A failure on one
/// enactment is logged and does not stop the sweep.
pub async fn sweep_orphans(ctx: &Context) -> Result<usize, Error> {
    let enactments = ctx.enactments.list(&EnactmentSelector::All).await?;

    let mut by_policy: BTreeMap<String, Vec<EnactmentKey>> = BTreeMap::new();
    for enactment in enactments.iter().filter(|e| !e.is_terminating()) {
        by_policy
            .entry(enactment.spec.policy_name.clone())
            .or_default()
            .push(enactment.key());
    }

    let mut deleted = 0;
    for (policy, keys) in by_policy {
        if ctx.policies.get(&policy).await?.is_some() {
            continue;
        }
        for key in keys {
            match ctx.enactments.delete(&key).await {
                Ok(outcome) => {
                    info!(
                        enactment = %key,
                        pending = outcome == DeleteOutcome::Pending,
                        "Deleted orphaned enactment"
                    );
                    deleted += 1;
                }
                Err(e) => warn!(enactment = %key, error = %e, "Failed to delete orphaned enactment"),
            }
        }
    }

    Ok(deleted)
}

/// Run [`sweep_orphans`] forever on the configured interval
///
/// The first sweep runs immediately so a restarted controller cleans up
/// what it missed while it was down.
pub async fn run_orphan_sweeper(ctx: Arc<Context>) {
    let mut interval = tokio::time::interval(ctx.config.orphan_sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match sweep_orphans(&ctx).await {
            Ok(0) => debug!("Orphan sweep found nothing"),
            Ok(count) => info!(count, "Orphan sweep requested deletions"),
            Err(e) => warn!(error = %e, "Orphan sweep failed"),
        }
    }
}
