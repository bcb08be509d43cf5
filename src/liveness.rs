//! Node liveness
//!
//! Reachability is derived fresh from Node objects on every reconcile pass.
//! It only paces deletion polling: an unreachable node never causes an
//! enactment to be skipped or force-deleted.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

/// Taint the node lifecycle controller puts on nodes it cannot reach
pub const UNREACHABLE_TAINT: &str = "node.kubernetes.io/unreachable";

/// A cluster node as seen by the reconciler
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Node labels, matched against policy selectors
    pub labels: BTreeMap<String, String>,
    /// Whether the node's agent can currently act on changes
    pub reachable: bool,
}

impl NodeInfo {
    /// Build from a Node object, judging reachability at `now`
    pub fn from_node(node: &Node, now: DateTime<Utc>, heartbeat_grace: Duration) -> Self {
        Self {
            name: node.name_any(),
            labels: node.labels().clone(),
            reachable: is_node_reachable(node, now, heartbeat_grace),
        }
    }
}

/// A node is reachable when it is Ready, not tainted unreachable, and its
/// Ready heartbeat (when reported) is younger than `heartbeat_grace`.
pub fn is_node_reachable(node: &Node, now: DateTime<Utc>, heartbeat_grace: Duration) -> bool {
    let tainted = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == UNREACHABLE_TAINT));
    if tainted {
        return false;
    }

    let Some(ready) = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
    else {
        return false;
    };

    if ready.status != "True" {
        return false;
    }

    match ready.last_heartbeat_time.as_ref() {
        Some(heartbeat) => {
            let grace = chrono::Duration::from_std(heartbeat_grace)
                .unwrap_or_else(|_| chrono::Duration::MAX);
            now.signed_duration_since(heartbeat.0) <= grace
        }
        None => true,
    }
}

/// Liveness lookup consulted by the deletion state machine
pub trait NodeLiveness {
    /// Whether the named node is currently reachable
    fn is_reachable(&self, node: &str) -> bool;
}

/// Point-in-time liveness of the cluster's nodes
#[derive(Clone, Debug, Default)]
pub struct LivenessSnapshot {
    nodes: HashMap<String, bool>,
}

impl LivenessSnapshot {
    /// Snapshot the reachability of the given nodes
    pub fn from_nodes(nodes: &[NodeInfo]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|n| (n.name.clone(), n.reachable))
                .collect(),
        }
    }
}

impl NodeLiveness for LivenessSnapshot {
    /// Nodes missing from the snapshot are unreachable
    fn is_reachable(&self, node: &str) -> bool {
        self.nodes.get(node).copied().unwrap_or(false)
    }
}
