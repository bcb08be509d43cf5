//! Controller configuration
//!
//! The values here are tunable from the command line (see `main.rs`). The two
//! poll intervals are deliberately separate: the fast path paces deletion
//! while a node can still answer, the reconnect path paces it while every
//! remaining node is away.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Default interval between deletion polls while a remaining node is reachable
pub const DEFAULT_FAST_POLL: Duration = Duration::from_secs(2);

/// Default interval between deletion polls while all remaining nodes are unreachable
pub const DEFAULT_RECONNECT_POLL: Duration = Duration::from_secs(30);

/// Default resync interval for converged policies
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// Default per-call store timeout
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default age after which a Ready heartbeat no longer counts
pub const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_secs(60);

/// Default interval between orphan sweeps
pub const DEFAULT_ORPHAN_SWEEP: Duration = Duration::from_secs(60);

/// Default cap for per-policy error backoff
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Tunables for the policy controller
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Deletion poll interval while at least one remaining node is reachable
    pub fast_poll_interval: Duration,
    /// Deletion poll interval while all remaining nodes are unreachable
    pub reconnect_poll_interval: Duration,
    /// Requeue interval for converged policies
    pub resync_interval: Duration,
    /// Timeout applied to every individual store call
    pub store_timeout: Duration,
    /// Ready heartbeats older than this mark a node unreachable
    pub heartbeat_grace: Duration,
    /// Interval between orphan sweeps
    pub orphan_sweep_interval: Duration,
    /// Backoff applied when a reconcile pass fails
    pub error_backoff: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fast_poll_interval: DEFAULT_FAST_POLL,
            reconnect_poll_interval: DEFAULT_RECONNECT_POLL,
            resync_interval: DEFAULT_RESYNC,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            orphan_sweep_interval: DEFAULT_ORPHAN_SWEEP,
            error_backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: DEFAULT_BACKOFF_MAX,
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl ControllerConfig {
    /// Poll interval for a terminating policy, paced by node liveness
    pub fn deletion_poll_interval(&self, any_remaining_reachable: bool) -> Duration {
        if any_remaining_reachable {
            self.fast_poll_interval
        } else {
            self.reconnect_poll_interval
        }
    }
}
