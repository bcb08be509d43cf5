//! Store interfaces consumed by the reconciler and the node agent
//!
//! The cluster API server is the only shared mutable state. These traits are
//! the narrow slice of it the operator needs; [`KubeStore`] implements all of
//! them against a real cluster, and tests substitute mocks or in-memory fakes.
//!
//! Every method can fail with a store error classified as NotFound, Conflict,
//! Unavailable or Timeout (see [`crate::error::StoreErrorKind`]).

mod kubernetes;

pub use kubernetes::KubeStore;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    is_label_value, Enactment, EnactmentKey, NodeNetworkConfigurationEnactmentStatus,
    NodeNetworkConfigurationPolicyStatus, Policy,
};
use crate::liveness::NodeInfo;
use crate::{Error, NODE_LABEL, POLICY_LABEL};

/// Which enactments to list
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnactmentSelector {
    /// Every enactment in the cluster
    All,
    /// Enactments referencing the named policy
    Policy(String),
    /// Enactments addressed to the named node
    Node(String),
}

impl EnactmentSelector {
    /// Kubernetes label selector string, if the name fits in a label value
    ///
    /// Without one the caller lists everything and narrows with [`Self::matches`].
    pub fn label_selector(&self) -> Option<String> {
        let (label, value) = match self {
            Self::All => return None,
            Self::Policy(policy) => (POLICY_LABEL, policy),
            Self::Node(node) => (NODE_LABEL, node),
        };
        is_label_value(value).then(|| format!("{label}={value}"))
    }

    /// True if the enactment falls under this selector
    pub fn matches(&self, enactment: &Enactment) -> bool {
        match self {
            Self::All => true,
            Self::Policy(policy) => enactment.spec.policy_name == *policy,
            Self::Node(node) => enactment.spec.node_name == *node,
        }
    }
}

/// Result of requesting deletion of an enactment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object is absent (deleted now, or already gone)
    Gone,
    /// Deletion is recorded but a finalizer still holds the object
    Pending,
}

/// Operations on enactment records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EnactmentStore: Send + Sync {
    /// Fetch one enactment; `None` if absent
    async fn get(&self, key: &EnactmentKey) -> Result<Option<Enactment>, Error>;

    /// List enactments matching the selector
    async fn list(&self, selector: &EnactmentSelector) -> Result<Vec<Enactment>, Error>;

    /// Create a new enactment; Conflict if one already exists for the key
    async fn create(&self, enactment: &Enactment) -> Result<Enactment, Error>;

    /// Replace the reconciler-owned fields of an enactment
    ///
    /// The enactment's `metadata.resourceVersion` is the expected version;
    /// the write fails with Conflict if the stored object changed since.
    async fn update(&self, enactment: &Enactment) -> Result<Enactment, Error>;

    /// Replace the agent-owned status, guarded by `expected_version`
    async fn update_status(
        &self,
        key: &EnactmentKey,
        status: &NodeNetworkConfigurationEnactmentStatus,
        expected_version: &str,
    ) -> Result<Enactment, Error>;

    /// Request deletion; NotFound is reported as [`DeleteOutcome::Gone`]
    async fn delete(&self, key: &EnactmentKey) -> Result<DeleteOutcome, Error>;

    /// Drop `finalizer` from the enactment, guarded by `expected_version`
    async fn release_finalizer(
        &self,
        key: &EnactmentKey,
        finalizer: &str,
        expected_version: &str,
    ) -> Result<(), Error>;
}

/// Operations on policies beyond what the watch delivers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// Fetch one policy; `None` if absent
    async fn get(&self, name: &str) -> Result<Option<Policy>, Error>;

    /// Add `finalizer` to the policy, guarded by its resourceVersion
    async fn add_finalizer(&self, policy: &Policy, finalizer: &str) -> Result<(), Error>;

    /// Remove `finalizer` from the policy, guarded by its resourceVersion
    async fn remove_finalizer(&self, policy: &Policy, finalizer: &str) -> Result<(), Error>;

    /// Replace the policy status
    async fn patch_status(
        &self,
        name: &str,
        status: &NodeNetworkConfigurationPolicyStatus,
    ) -> Result<(), Error>;
}

/// Read access to cluster membership
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// All nodes with labels and current reachability, read fresh
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error>;
}
