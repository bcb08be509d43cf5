//! Node agent side of the enactment lifecycle
//!
//! The agent runs on every node. It owns the status of the enactments
//! addressed to its node and the node finalizer on them: once an enactment is
//! marked for deletion, the agent releases whatever the node set up for it
//! and then drops the finalizer, which lets the store remove the record.
//!
//! The agent never talks to the controller; the store is the only channel.
//! A node that was down while its policy was deleted finds the terminating
//! enactment on its first pass after rejoining.
//!
//! # Example
//!
//! ```ignore
//! let agent = NodeAgent::new("worker-1", store, Arc::new(LoggingRelease));
//! agent.run(Duration::from_secs(2)).await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    Enactment, EnactmentConditionType, EnactmentKey, NodeNetworkConfigurationEnactmentStatus,
};
use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::store::{EnactmentSelector, EnactmentStore};
use crate::{Error, NODE_FINALIZER};

/// Node-local cleanup run before an enactment is released
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseHook: Send + Sync {
    /// Undo what the node applied for `enactment`
    ///
    /// An error keeps the node finalizer in place; the release is retried
    /// on the next pass.
    async fn release(&self, enactment: &Enactment) -> Result<(), Error>;
}

/// Release hook that only logs; the network state itself is managed elsewhere
pub struct LoggingRelease;

#[async_trait]
impl ReleaseHook for LoggingRelease {
    async fn release(&self, enactment: &Enactment) -> Result<(), Error> {
        info!(
            enactment = %enactment.key(),
            generation = enactment.spec.policy_generation,
            "Releasing node-local state"
        );
        Ok(())
    }
}

fn conflict_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(2),
        backoff_multiplier: 2.0,
    }
}

/// The agent for one node
pub struct NodeAgent {
    node_name: String,
    store: Arc<dyn EnactmentStore>,
    hook: Arc<dyn ReleaseHook>,
    retry: RetryConfig,
}

impl NodeAgent {
    /// Create an agent for `node_name`
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn EnactmentStore>,
        hook: Arc<dyn ReleaseHook>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            hook,
            retry: conflict_retry(),
        }
    }

    /// Override how conflicting writes are retried
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Name of the node this agent acts for
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Release every terminating enactment addressed to this node
    ///
    /// Returns how many enactments were released. A failure on one
    /// enactment is logged and does not stop the others.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn release_pending(&self) -> Result<usize, Error> {
        let enactments = self
            .store
            .list(&EnactmentSelector::Node(self.node_name.clone()))
            .await?;

        let mut released = 0;
        for enactment in enactments
            .iter()
            .filter(|e| e.is_terminating() && e.has_node_finalizer())
        {
            let key = enactment.key();
            if let Err(e) = self.hook.release(enactment).await {
                warn!(enactment = %key, error = %e, "Node-local release failed, keeping finalizer");
                continue;
            }
            match self.release_finalizer(&key).await {
                Ok(()) => {
                    info!(enactment = %key, "Released enactment");
                    released += 1;
                }
                Err(e) => warn!(enactment = %key, error = %e, "Failed to release enactment"),
            }
        }
        Ok(released)
    }

    /// Drop the node finalizer, re-reading the enactment on every conflict
    async fn release_finalizer(&self, key: &EnactmentKey) -> Result<(), Error> {
        retry_with_backoff_if(
            &self.retry,
            &format!("release enactment {key}"),
            || async {
                let Some(current) = self.store.get(key).await? else {
                    return Ok(());
                };
                if !current.has_node_finalizer() {
                    return Ok(());
                }
                let version = current.metadata.resource_version.clone().unwrap_or_default();
                self.store
                    .release_finalizer(key, NODE_FINALIZER, &version)
                    .await
            },
            Error::is_conflict,
        )
        .await
    }

    /// Record the application state of `policy` on this node
    ///
    /// The write carries the version just read and is retried on conflict.
    /// Reporting the condition already recorded for the current generation
    /// is a no-op.
    pub async fn report(
        &self,
        policy: &str,
        condition: EnactmentConditionType,
        message: Option<String>,
    ) -> Result<(), Error> {
        let key = EnactmentKey::new(&self.node_name, policy);
        retry_with_backoff_if(
            &self.retry,
            &format!("report status of enactment {key}"),
            || async {
                let current = self
                    .store
                    .get(&key)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("get enactment {key}")))?;

                let previous = current.status.clone().unwrap_or_default();
                let generation = current.spec.policy_generation;
                if current.status.is_some()
                    && previous.condition == condition
                    && previous.observed_generation == Some(generation)
                    && previous.message == message
                {
                    debug!(enactment = %key, %condition, "Status unchanged");
                    return Ok(());
                }

                let last_transition_time = if previous.condition == condition {
                    previous.last_transition_time.or_else(|| Some(Utc::now()))
                } else {
                    Some(Utc::now())
                };
                let status = NodeNetworkConfigurationEnactmentStatus {
                    condition,
                    last_transition_time,
                    message: message.clone(),
                    observed_generation: Some(generation),
                };
                let version = current.metadata.resource_version.clone().unwrap_or_default();
                self.store.update_status(&key, &status, &version).await?;
                debug!(enactment = %key, %condition, "Reported status");
                Ok::<(), Error>(())
            },
            Error::is_conflict,
        )
        .await
    }

    /// Release pending enactments now and then on every tick, forever
    pub async fn run(self, interval: Duration) {
        info!(node = %self.node_name, ?interval, "Starting node agent");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.release_pending().await {
                Ok(0) => {}
                Ok(count) => info!(node = %self.node_name, count, "Released enactments"),
                Err(e) => warn!(node = %self.node_name, error = %e, "Release pass failed"),
            }
        }
    }
}
