//! Kubernetes-backed store
//!
//! Every call is bounded by the configured per-call timeout and its failure is
//! classified into a store error. Writes that must not clobber concurrent
//! changes carry the caller's resourceVersion as a precondition.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::{DeleteOutcome, EnactmentSelector, EnactmentStore, NodeInventory, PolicyClient};
use crate::config::ControllerConfig;
use crate::crd::{
    Enactment, EnactmentKey, NodeNetworkConfigurationEnactmentStatus,
    NodeNetworkConfigurationPolicyStatus, Policy,
};
use crate::error::{classify_kube_error, StoreErrorKind};
use crate::liveness::NodeInfo;
use crate::{Error, FIELD_MANAGER};

/// Store implementation on top of a kube-rs client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
    heartbeat_grace: Duration,
}

impl KubeStore {
    /// Create a store using the timeouts from `config`
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            timeout: config.store_timeout,
            heartbeat_grace: config.heartbeat_grace,
        }
    }

    fn enactments(&self) -> Api<Enactment> {
        Api::all(self.client.clone())
    }

    fn policies(&self) -> Api<Policy> {
        Api::all(self.client.clone())
    }

    /// Run one API call under the per-call timeout
    async fn call<T, F>(&self, operation: String, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_kube_error(operation, e)),
            Err(_) => Err(Error::store(
                StoreErrorKind::Timeout,
                operation,
                format!("no answer within {:?}", self.timeout),
            )),
        }
    }

    async fn patch_policy_finalizers(
        &self,
        policy: &Policy,
        finalizers: Vec<String>,
        operation: String,
    ) -> Result<(), Error> {
        let patch = finalizer_patch(&finalizers, policy.resource_version().as_deref());
        let api = self.policies();
        let name = policy.name_any();
        self.call(
            operation,
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn list_params(selector: &EnactmentSelector) -> ListParams {
    match selector.label_selector() {
        Some(labels) => ListParams::default().labels(&labels),
        None => ListParams::default(),
    }
}

/// Merge patch replacing the finalizer list, rejected with 409 if the object
/// moved past `resource_version`
fn finalizer_patch(finalizers: &[String], resource_version: Option<&str>) -> serde_json::Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": resource_version,
        }
    })
}

fn without_finalizer(finalizers: &[String], finalizer: &str) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect()
}

/// `None` if `finalizer` is already present
fn with_finalizer(finalizers: &[String], finalizer: &str) -> Option<Vec<String>> {
    if finalizers.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut updated = finalizers.to_vec();
    updated.push(finalizer.to_string());
    Some(updated)
}

/// Map a delete response; `still_present` is true when the server returned
/// the object instead of a Status
fn delete_outcome(result: Result<bool, Error>) -> Result<DeleteOutcome, Error> {
    match result {
        Ok(true) => Ok(DeleteOutcome::Pending),
        Ok(false) => Ok(DeleteOutcome::Gone),
        Err(e) if e.is_not_found() => Ok(DeleteOutcome::Gone),
        Err(e) => Err(e),
    }
}

/// A write against an object that is already gone has nothing left to do
fn ignore_not_found<T>(result: Result<T, Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl EnactmentStore for KubeStore {
    async fn get(&self, key: &EnactmentKey) -> Result<Option<Enactment>, Error> {
        let api = self.enactments();
        let name = key.name();
        self.call(format!("get enactment {name}"), api.get_opt(&name))
            .await
    }

    async fn list(&self, selector: &EnactmentSelector) -> Result<Vec<Enactment>, Error> {
        let api = self.enactments();
        let list = self
            .call(
                format!("list enactments {selector:?}"),
                api.list(&list_params(selector)),
            )
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter(|e| selector.matches(e))
            .collect())
    }

    async fn create(&self, enactment: &Enactment) -> Result<Enactment, Error> {
        let api = self.enactments();
        self.call(
            format!("create enactment {}", enactment.name_any()),
            api.create(&post_params(), enactment),
        )
        .await
    }

    async fn update(&self, enactment: &Enactment) -> Result<Enactment, Error> {
        let name = enactment.name_any();
        if enactment.resource_version().is_none() {
            return Err(Error::internal_with_context(
                "store",
                format!("update of enactment {name} without resourceVersion"),
            ));
        }
        let api = self.enactments();
        self.call(
            format!("update enactment {name}"),
            api.replace(&name, &post_params(), enactment),
        )
        .await
    }

    async fn update_status(
        &self,
        key: &EnactmentKey,
        status: &NodeNetworkConfigurationEnactmentStatus,
        expected_version: &str,
    ) -> Result<Enactment, Error> {
        let name = key.name();
        let patch = json!({
            "metadata": { "resourceVersion": expected_version },
            "status": status,
        });
        let api = self.enactments();
        self.call(
            format!("update status of enactment {name}"),
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn delete(&self, key: &EnactmentKey) -> Result<DeleteOutcome, Error> {
        let name = key.name();
        let api = self.enactments();
        // The server hands back the object while finalizers still hold it
        let result = self
            .call(
                format!("delete enactment {name}"),
                api.delete(&name, &DeleteParams::default()),
            )
            .await
            .map(|response| response.is_left());
        let outcome = delete_outcome(result)?;
        debug!(enactment = %name, ?outcome, "Requested enactment deletion");
        Ok(outcome)
    }

    async fn release_finalizer(
        &self,
        key: &EnactmentKey,
        finalizer: &str,
        expected_version: &str,
    ) -> Result<(), Error> {
        let Some(current) = EnactmentStore::get(self, key).await? else {
            return Ok(());
        };
        let remaining = without_finalizer(current.finalizers(), finalizer);
        let patch = finalizer_patch(&remaining, Some(expected_version));
        let name = key.name();
        let api = self.enactments();
        ignore_not_found(
            self.call(
                format!("release finalizer {finalizer} on enactment {name}"),
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await,
        )
    }
}

#[async_trait]
impl PolicyClient for KubeStore {
    async fn get(&self, name: &str) -> Result<Option<Policy>, Error> {
        let api = self.policies();
        self.call(format!("get policy {name}"), api.get_opt(name))
            .await
    }

    async fn add_finalizer(&self, policy: &Policy, finalizer: &str) -> Result<(), Error> {
        let Some(finalizers) = with_finalizer(policy.finalizers(), finalizer) else {
            return Ok(());
        };
        self.patch_policy_finalizers(
            policy,
            finalizers,
            format!("add finalizer to policy {}", policy.name_any()),
        )
        .await
    }

    async fn remove_finalizer(&self, policy: &Policy, finalizer: &str) -> Result<(), Error> {
        let finalizers = without_finalizer(policy.finalizers(), finalizer);
        ignore_not_found(
            self.patch_policy_finalizers(
                policy,
                finalizers,
                format!("remove finalizer from policy {}", policy.name_any()),
            )
            .await,
        )
    }

    async fn patch_status(
        &self,
        name: &str,
        status: &NodeNetworkConfigurationPolicyStatus,
    ) -> Result<(), Error> {
        let api = self.policies();
        let patch = json!({ "status": status });
        self.call(
            format!("patch status of policy {name}"),
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeInventory for KubeStore {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = self
            .call("list nodes".to_string(), api.list(&ListParams::default()))
            .await?;
        let now = Utc::now();
        Ok(nodes
            .items
            .iter()
            .map(|node| NodeInfo::from_node(node, now, self.heartbeat_grace))
            .collect())
    }
}
