//! nodenet - node network configuration policy operator

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use nodenet::agent::{LoggingRelease, NodeAgent};
use nodenet::config::{self, ControllerConfig};
use nodenet::controller::{build_controllers, Context};
use nodenet::crd::{Enactment, Policy};
use nodenet::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use nodenet::retry::{retry_with_backoff, RetryConfig};
use nodenet::store::KubeStore;
use nodenet::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use nodenet::FIELD_MANAGER;

/// nodenet - lifecycle operator for NodeNetworkConfigurationPolicy resources
#[derive(Parser, Debug)]
#[command(name = "nodenet", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "NODENET_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the policy controller (default mode)
    ///
    /// Watches policies, enactments and nodes; keeps one enactment per
    /// selected node and drives deletion until every node has released its
    /// enactment.
    Controller(ControllerArgs),

    /// Run the node agent
    ///
    /// Releases terminating enactments addressed to this node, including the
    /// ones it missed while the node was down.
    Agent(AgentArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
#[command(name = "controller")]
struct ControllerArgs {
    /// Deletion poll interval while a remaining node is reachable
    #[arg(long, env = "NODENET_FAST_POLL_SECS", default_value_t = config::DEFAULT_FAST_POLL.as_secs())]
    fast_poll_secs: u64,

    /// Deletion poll interval while every remaining node is unreachable
    #[arg(long, env = "NODENET_RECONNECT_POLL_SECS", default_value_t = config::DEFAULT_RECONNECT_POLL.as_secs())]
    reconnect_poll_secs: u64,

    /// Requeue interval for converged policies
    #[arg(long, env = "NODENET_RESYNC_SECS", default_value_t = config::DEFAULT_RESYNC.as_secs())]
    resync_secs: u64,

    /// Timeout for each API call
    #[arg(long, env = "NODENET_STORE_TIMEOUT_SECS", default_value_t = config::DEFAULT_STORE_TIMEOUT.as_secs())]
    store_timeout_secs: u64,

    /// Node heartbeats older than this mark the node unreachable
    #[arg(long, env = "NODENET_HEARTBEAT_GRACE_SECS", default_value_t = config::DEFAULT_HEARTBEAT_GRACE.as_secs())]
    heartbeat_grace_secs: u64,

    /// Interval between orphaned enactment sweeps
    #[arg(long, env = "NODENET_ORPHAN_SWEEP_SECS", default_value_t = config::DEFAULT_ORPHAN_SWEEP.as_secs())]
    orphan_sweep_secs: u64,

    /// Cap for the per-policy error backoff
    #[arg(long, env = "NODENET_BACKOFF_MAX_SECS", default_value_t = config::DEFAULT_BACKOFF_MAX.as_secs())]
    backoff_max_secs: u64,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "NODENET_LEADER_ELECTION")]
    leader_election: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "nmstate")]
    lease_namespace: String,

    /// Identity used in the leader lease
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,
}

impl ControllerArgs {
    fn to_config(&self) -> ControllerConfig {
        let mut config = ControllerConfig {
            fast_poll_interval: Duration::from_secs(self.fast_poll_secs),
            reconnect_poll_interval: Duration::from_secs(self.reconnect_poll_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            heartbeat_grace: Duration::from_secs(self.heartbeat_grace_secs),
            orphan_sweep_interval: Duration::from_secs(self.orphan_sweep_secs),
            ..Default::default()
        };
        config.error_backoff.max_delay = Duration::from_secs(self.backoff_max_secs);
        config
    }
}

/// Agent mode arguments
#[derive(Args, Debug)]
struct AgentArgs {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Interval between release passes
    #[arg(long, env = "NODENET_RELEASE_POLL_SECS", default_value_t = 2)]
    release_poll_secs: u64,

    /// Timeout for each API call
    #[arg(long, env = "NODENET_STORE_TIMEOUT_SECS", default_value_t = config::DEFAULT_STORE_TIMEOUT.as_secs())]
    store_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [Policy::crd(), Enactment::crd()] {
            let yaml = serde_yaml::to_string(&crd).context("Failed to serialize CRD")?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let service_name = match cli.command {
        Some(Commands::Agent(_)) => "nodenet-agent",
        _ => "nodenet-controller",
    };
    init_telemetry(TelemetryConfig {
        service_name: service_name.to_string(),
        format: cli.log_format,
    })?;

    match cli.command {
        Some(Commands::Agent(args)) => run_agent(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            let args = ControllerArgs::parse_from(["controller"]);
            run_controller(args).await
        }
    }
}

/// Install or update both CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Policy::crd(), Enactment::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        let patch = Patch::Apply(&crd);
        retry_with_backoff(
            &RetryConfig::with_max_attempts(5),
            &format!("install CRD {name}"),
            || crds.patch(&name, &params, &patch),
        )
        .await
        .with_context(|| format!("Failed to install CRD {name}"))?;
    }

    tracing::info!("All CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("nodenet controller starting...");

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    ensure_crds_installed(&client).await?;

    let mut leader = if args.leader_election {
        let identity = args
            .identity
            .clone()
            .context("--identity (POD_NAME) is required with --leader-election")?;
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &args.lease_namespace,
            &identity,
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let config = args.to_config();
    tracing::info!(?config, "Controller configuration");
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
    let controllers = futures::future::join_all(build_controllers(client, ctx));

    match leader.as_mut() {
        Some(guard) => {
            tokio::select! {
                _ = controllers => tracing::info!("Controllers completed"),
                _ = guard.lost() => {
                    // exit so the replacement starts from a clean slate
                    anyhow::bail!("Leadership lost");
                }
            }
            if let Err(e) = guard.release_leadership().await {
                tracing::warn!(error = %e, "Failed to release leadership");
            }
        }
        None => {
            controllers.await;
        }
    }

    tracing::info!("nodenet controller shutting down");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    tracing::info!(node = %args.node_name, "nodenet agent starting...");

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let config = ControllerConfig {
        store_timeout: Duration::from_secs(args.store_timeout_secs),
        ..Default::default()
    };
    let store = Arc::new(KubeStore::new(client, &config));
    let agent = NodeAgent::new(&args.node_name, store, Arc::new(LoggingRelease));

    tokio::select! {
        _ = agent.run(Duration::from_secs(args.release_poll_secs)) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Received shutdown signal"),
    }

    tracing::info!("nodenet agent shutting down");
    Ok(())
}
