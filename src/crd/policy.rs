//! NodeNetworkConfigurationPolicy Custom Resource Definition
//!
//! A policy names a desired network state and selects the nodes that should
//! apply it. The operator creates one enactment per selected node and keeps
//! the policy around (via a finalizer) until every enactment is gone.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus};
use crate::Error;

/// Specification for a NodeNetworkConfigurationPolicy
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nmstate.io",
    version = "v1",
    kind = "NodeNetworkConfigurationPolicy",
    plural = "nodenetworkconfigurationpolicies",
    shortname = "nncp",
    status = "NodeNetworkConfigurationPolicyStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigurationPolicySpec {
    /// Node labels that must all match for a node to apply this policy.
    /// Absent or empty selects every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Desired network state, passed to node agents verbatim
    #[serde(default)]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub desired_state: serde_json::Value,
}

impl NodeNetworkConfigurationPolicySpec {
    /// Validate the node selector and return it in matchable form
    pub fn node_selector(&self, policy: &str) -> Result<NodeSelector, Error> {
        let labels = self.node_selector.clone().unwrap_or_default();
        for (key, value) in &labels {
            validate_label_key(key).map_err(|msg| {
                Error::validation_for_field(policy, "spec.nodeSelector", msg)
            })?;
            validate_label_value(value).map_err(|msg| {
                Error::validation_for_field(policy, format!("spec.nodeSelector.{key}"), msg)
            })?;
        }
        Ok(NodeSelector { match_labels: labels })
    }
}

/// A validated equality-based label selector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSelector {
    match_labels: BTreeMap<String, String>,
}

impl NodeSelector {
    /// True if every selector label is present with the same value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// True if the selector matches every node
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

const MAX_LABEL_NAME_LEN: usize = 63;
const MAX_LABEL_PREFIX_LEN: usize = 253;

fn is_label_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

/// Label names and values share the same shape: alphanumeric at both ends,
/// `-`, `_` and `.` allowed in between.
fn validate_label_name(name: &str, what: &str) -> Result<(), String> {
    if name.len() > MAX_LABEL_NAME_LEN {
        return Err(format!(
            "{what} '{name}' exceeds {MAX_LABEL_NAME_LEN} characters"
        ));
    }
    let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok || !name.chars().all(is_label_name_char) {
        return Err(format!(
            "{what} '{name}' must be alphanumeric with '-', '_' or '.' in between"
        ));
    }
    Ok(())
}

fn validate_label_key(key: &str) -> Result<(), String> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            let prefix_ok = !prefix.is_empty()
                && prefix.len() <= MAX_LABEL_PREFIX_LEN
                && prefix.split('.').all(|part| {
                    !part.is_empty()
                        && part.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                        && !part.starts_with('-')
                        && !part.ends_with('-')
                });
            if !prefix_ok {
                return Err(format!("label key prefix '{prefix}' is not a DNS subdomain"));
            }
            name
        }
        None => key,
    };
    if name.is_empty() {
        return Err(format!("label key '{key}' has an empty name"));
    }
    validate_label_name(name, "label key")
}

fn validate_label_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    validate_label_name(value, "label value")
}

/// True if `value` can be stored as a label value (at most 63 characters)
pub fn is_label_value(value: &str) -> bool {
    validate_label_value(value).is_ok()
}

/// Status for a NodeNetworkConfigurationPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigurationPolicyStatus {
    /// Aggregate conditions: Available, Progressing, Degraded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Policy generation these conditions were computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-condition enactment counts
    #[serde(default)]
    pub enactments: EnactmentCounts,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeNetworkConfigurationPolicyStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True if the condition of the given type is present and True
    pub fn is_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

/// How many enactments of a policy are in each state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnactmentCounts {
    /// Nodes currently selected by the policy
    pub matched: u32,
    /// Enactments reporting Available
    pub available: u32,
    /// Enactments reporting Progressing
    pub progressing: u32,
    /// Enactments not yet picked up by their node
    pub pending: u32,
    /// Enactments reporting Failing
    pub failing: u32,
    /// Enactments waiting for their node to release them
    pub terminating: u32,
}
