//! Controller runner - builds the policy controller and its companions
//!
//! [`build_controllers`] returns boxed futures that the caller composes, the
//! same way regardless of whether leader election is enabled.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use super::context::Context;
use super::orphans::run_orphan_sweeper;
use super::policy::{error_policy, reconcile};
use crate::crd::{Enactment, Policy};
use crate::liveness::is_node_reachable;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the policy controller and the orphan sweeper
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let policies: Api<Policy> = Api::all(client.clone());
    let enactments: Api<Enactment> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client);

    tracing::info!("- NodeNetworkConfigurationPolicy controller");
    tracing::info!("- Orphaned enactment sweeper");

    let controller = Controller::new(
        policies,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );
    let policy_store = controller.store();
    let node_changes = Arc::new(NodeChangeFilter::new(ctx.config.heartbeat_grace));

    let policy_ctrl = controller
        .watches(
            enactments,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            |enactment: Enactment| {
                Some(ObjectRef::<Policy>::new(&enactment.spec.policy_name))
            },
        )
        .watches(
            nodes,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |node: Node| {
                if !node_changes.changed(&node) {
                    return vec![];
                }
                let affected: Vec<ObjectRef<Policy>> = policy_store
                    .state()
                    .iter()
                    .map(|policy| ObjectRef::from_obj(policy.as_ref()))
                    .collect();
                tracing::debug!(
                    node = %node.name_any(),
                    policies = affected.len(),
                    "Node membership or liveness changed, re-reconciling policies"
                );
                affected
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Policy"));

    vec![Box::pin(policy_ctrl), Box::pin(run_orphan_sweeper(ctx))]
}

/// Entries untouched for this many heartbeat grace periods are forgotten
const SEEN_RETENTION_GRACES: u32 = 10;

/// What a node looked like when it last triggered
#[derive(Clone, Debug)]
struct Observation {
    reachable: bool,
    labels: BTreeMap<String, String>,
    at: Instant,
}

/// Remembers what each node looked like the last time it triggered
///
/// Kubelets update their Node status every few seconds; only a change in
/// labels or reachability matters to policies. Deleted nodes are dropped,
/// as are nodes not heard from within the retention window, so the map
/// follows the live node set.
struct NodeChangeFilter {
    heartbeat_grace: Duration,
    retention: Duration,
    seen: DashMap<String, Observation>,
}

impl NodeChangeFilter {
    fn new(heartbeat_grace: Duration) -> Self {
        Self {
            heartbeat_grace,
            retention: heartbeat_grace * SEEN_RETENTION_GRACES,
            seen: DashMap::new(),
        }
    }

    /// True the first time a node is seen, whenever its labels or
    /// reachability differ from the previous observation, and when it is
    /// being deleted
    fn changed(&self, node: &Node) -> bool {
        let now = Instant::now();
        self.forget_stale(now);

        let name = node.name_any();
        if node.metadata.deletion_timestamp.is_some() {
            self.seen.remove(&name);
            return true;
        }

        let current = Observation {
            reachable: is_node_reachable(node, Utc::now(), self.heartbeat_grace),
            labels: node.labels().clone(),
            at: now,
        };
        match self.seen.insert(name, current.clone()) {
            Some(previous) => {
                previous.reachable != current.reachable || previous.labels != current.labels
            }
            None => true,
        }
    }

    fn forget_stale(&self, now: Instant) {
        self.seen
            .retain(|_, seen| now.saturating_duration_since(seen.at) < self.retention);
    }
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
