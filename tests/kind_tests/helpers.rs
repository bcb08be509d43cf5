//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster and for running the
//! controller and node agents in-process.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use nodenet::agent::{LoggingRelease, NodeAgent};
use nodenet::config::ControllerConfig;
use nodenet::controller::{build_controllers, Context};
use nodenet::crd::{Enactment, NodeNetworkConfigurationPolicySpec, Policy};
use nodenet::liveness::is_node_reachable;
use nodenet::store::KubeStore;
use nodenet::FIELD_MANAGER;

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "nodenet-integration-test";

/// Worker node names kind assigns for a three-worker cluster
pub const WORKERS: [&str; 3] = [
    "nodenet-integration-test-worker",
    "nodenet-integration-test-worker2",
    "nodenet-integration-test-worker3",
];

const KIND_CONFIG: &str = r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
- role: control-plane
- role: worker
- role: worker
- role: worker
"#;

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRDs have been installed (async-safe)
static CRD_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Only one harness may run controllers against the cluster at a time
static HARNESS_LOCK: Mutex<()> = Mutex::const_new(());

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster with three workers
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let mut child = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "120s", "--config", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to run kind: {e}"))?;
    child
        .stdin
        .take()
        .ok_or("kind stdin unavailable")?
        .write_all(KIND_CONFIG.as_bytes())
        .map_err(|e| format!("failed to write kind config: {e}"))?;
    let output = child
        .wait_with_output()
        .map_err(|e| format!("failed to wait for kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Install both CRDs into the cluster
pub async fn install_crds(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in [Policy::crd(), Enactment::crd()] {
        let name = crd.metadata.name.clone().unwrap();
        println!("Installing CRD {name}...");
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }

    // Wait for CRDs to be established
    sleep(Duration::from_secs(2)).await;
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (cluster created once, CRDs installed once)
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRD_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crds(&client)
                .await
                .map_err(|e| format!("failed to install CRDs: {e}"))
        })
        .await;
    crd_result.clone()?;

    Ok(client)
}

/// Run a docker command against a kind node container
pub fn docker(action: &str, node: &str) -> Result<(), String> {
    let output = Command::new("docker")
        .args([action, node])
        .output()
        .map_err(|e| format!("failed to run docker: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "docker {action} {node} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

/// Poll `check` until it returns true or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(interval).await;
    }
}

/// Whether the API server currently considers `node` reachable
pub async fn node_reachable(client: &Client, node: &str) -> bool {
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.get(node).await {
        Ok(n) => is_node_reachable(
            &n,
            chrono::Utc::now(),
            ControllerConfig::default().heartbeat_grace,
        ),
        Err(_) => false,
    }
}

/// Label key the stories select nodes with
pub const TEST_LABEL: &str = "nodenet.test/bridge";

/// Set or remove a label on a node
pub async fn set_node_label(client: &Client, node: &str, key: &str, value: Option<&str>) {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({ "metadata": { "labels": { key: value } } });
    nodes
        .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to label node");
}

/// Label every worker with `TEST_LABEL=true`
pub async fn label_workers(client: &Client) {
    for node in WORKERS {
        set_node_label(client, node, TEST_LABEL, Some("true")).await;
    }
}

/// Starts a stopped node container again when dropped, even if the test panics
pub struct RestartOnDrop(pub &'static str);

impl Drop for RestartOnDrop {
    fn drop(&mut self) {
        let _ = docker("start", self.0);
    }
}

/// Policy selecting every node that carries `label`
pub fn sample_policy(name: &str, label: Option<(&str, &str)>) -> Policy {
    let node_selector = label.map(|(k, v)| BTreeMap::from([(k.to_string(), v.to_string())]));
    Policy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: NodeNetworkConfigurationPolicySpec {
            node_selector,
            desired_state: serde_json::json!({
                "interfaces": [{
                    "name": name,
                    "type": "linux-bridge",
                    "state": "up",
                    "bridge": { "port": [] }
                }]
            }),
        },
        status: None,
    }
}

/// Delete a policy left over from an earlier run and wait until it is gone
pub async fn cleanup_policy(client: &Client, name: &str) {
    let api: Api<Policy> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
    wait_for(Duration::from_secs(60), Duration::from_secs(1), || async {
        matches!(api.get_opt(name).await, Ok(None))
    })
    .await;
}

/// Controller plus one agent per worker, all running in-process
pub struct Harness {
    pub client: Client,
    controller: JoinHandle<()>,
    agents: HashMap<String, JoinHandle<()>>,
    _lock: MutexGuard<'static, ()>,
}

impl Harness {
    /// Start the controller and an agent on every worker
    pub async fn start() -> Self {
        let lock = HARNESS_LOCK.lock().await;
        let client = ensure_test_cluster()
            .await
            .expect("failed to setup cluster");

        let ctx = Arc::new(Context::builder(client.clone()).build());
        let controllers = build_controllers(client.clone(), ctx);
        let controller = tokio::spawn(async move {
            futures::future::join_all(controllers).await;
        });

        let mut harness = Self {
            client,
            controller,
            agents: HashMap::new(),
            _lock: lock,
        };
        for node in WORKERS {
            harness.start_agent(node);
        }
        harness
    }

    /// Start the agent for `node`, replacing one already running
    pub fn start_agent(&mut self, node: &str) {
        self.stop_agent(node);
        let store = Arc::new(KubeStore::new(
            self.client.clone(),
            &ControllerConfig::default(),
        ));
        let agent = NodeAgent::new(node, store, Arc::new(LoggingRelease));
        let handle = tokio::spawn(agent.run(Duration::from_secs(1)));
        self.agents.insert(node.to_string(), handle);
    }

    /// Stop the agent for `node`, as if the node went down
    pub fn stop_agent(&mut self, node: &str) {
        if let Some(handle) = self.agents.remove(node) {
            handle.abort();
        }
    }

    pub fn policies(&self) -> Api<Policy> {
        Api::all(self.client.clone())
    }

    pub fn enactments(&self) -> Api<Enactment> {
        Api::all(self.client.clone())
    }

    /// Enactments currently stored for `policy`
    pub async fn enactments_of(&self, policy: &str) -> Vec<Enactment> {
        self.enactments()
            .list(&Default::default())
            .await
            .expect("failed to list enactments")
            .items
            .into_iter()
            .filter(|e| e.spec.policy_name == policy)
            .collect()
    }

    /// Wait until `policy` no longer exists
    pub async fn wait_gone(&self, policy: &str, timeout: Duration) -> bool {
        let api = self.policies();
        wait_for(timeout, Duration::from_secs(1), || async {
            matches!(api.get_opt(policy).await, Ok(None))
        })
        .await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.controller.abort();
        for handle in self.agents.values() {
            handle.abort();
        }
    }
}
