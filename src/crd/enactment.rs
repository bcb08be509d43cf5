//! NodeNetworkConfigurationEnactment Custom Resource Definition
//!
//! One enactment exists per (node, policy) pair. The reconciler owns the spec
//! (which policy generation the node should apply); the node agent owns the
//! status. The node finalizer is the node-held guard: the enactment cannot
//! disappear until the node agent has released its local resources.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::policy::{is_label_value, NodeNetworkConfigurationPolicy};
use super::types::EnactmentConditionType;
use crate::{NODE_FINALIZER, NODE_LABEL, POLICY_LABEL};

/// Specification for a NodeNetworkConfigurationEnactment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nmstate.io",
    version = "v1",
    kind = "NodeNetworkConfigurationEnactment",
    plural = "nodenetworkconfigurationenactments",
    shortname = "nnce",
    status = "NodeNetworkConfigurationEnactmentStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.policyName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.condition"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigurationEnactmentSpec {
    /// Node this enactment is addressed to
    pub node_name: String,

    /// Name of the owning policy (lookup only)
    pub policy_name: String,

    /// Policy generation the desired state was copied from
    pub policy_generation: i64,

    /// Snapshot of the policy's desired state
    #[serde(default)]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub desired_state: serde_json::Value,
}

/// Status for a NodeNetworkConfigurationEnactment, written by the node agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigurationEnactmentStatus {
    /// Last-known application state on the node
    #[serde(default)]
    pub condition: EnactmentConditionType,

    /// When `condition` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Human-readable detail from the node agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Policy generation the node last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Longest object name the API server accepts
pub const MAX_ENACTMENT_NAME_LEN: usize = 253;

/// Identity of an enactment: the (node, policy) pair
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnactmentKey {
    /// Node name
    pub node: String,
    /// Policy name
    pub policy: String,
}

impl EnactmentKey {
    /// Create a key for the given node and policy
    pub fn new(node: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            policy: policy.into(),
        }
    }

    /// Object name of the enactment: `<node>.<policy>`
    pub fn name(&self) -> String {
        format!("{}.{}", self.node, self.policy)
    }

    /// True if `<node>.<policy>` is short enough to be an object name
    pub fn name_fits(&self) -> bool {
        self.node.len() + 1 + self.policy.len() <= MAX_ENACTMENT_NAME_LEN
    }
}

impl std::fmt::Display for EnactmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.policy)
    }
}

impl NodeNetworkConfigurationEnactment {
    /// Build the enactment a policy wants on `node`, carrying the node-held finalizer
    ///
    /// Policy and node names longer than a label value allows are left
    /// unlabelled; lookups for them filter on the spec instead.
    pub fn for_policy(policy: &NodeNetworkConfigurationPolicy, node: &str) -> Self {
        let key = EnactmentKey::new(node, policy.name_any());
        let labels: BTreeMap<String, String> = [
            (POLICY_LABEL, key.policy.as_str()),
            (NODE_LABEL, key.node.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| is_label_value(value))
        .map(|(label, value)| (label.to_string(), value.to_string()))
        .collect();
        Self {
            metadata: ObjectMeta {
                name: Some(key.name()),
                labels: Some(labels),
                finalizers: Some(vec![NODE_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: NodeNetworkConfigurationEnactmentSpec {
                node_name: key.node,
                policy_name: key.policy,
                policy_generation: policy.metadata.generation.unwrap_or_default(),
                desired_state: policy.spec.desired_state.clone(),
            },
            status: None,
        }
    }

    /// The (node, policy) key of this enactment
    pub fn key(&self) -> EnactmentKey {
        EnactmentKey::new(&self.spec.node_name, &self.spec.policy_name)
    }

    /// Current condition; an enactment without status is Pending
    pub fn condition(&self) -> EnactmentConditionType {
        self.status
            .as_ref()
            .map(|s| s.condition)
            .unwrap_or_default()
    }

    /// True once deletion has been requested
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True while the node agent still holds the enactment
    pub fn has_node_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == NODE_FINALIZER)
    }
}
