//! Runtime configuration for the agent

use std::time::Duration;

use kubesim_common::{Error, Result, NODE_LEASE_DURATION_SECS, NODE_LEASE_NAMESPACE};

/// Largest fleet one agent can drive; node index i maps to 10.244.{i+1}.0/24
pub const MAX_NODE_COUNT: u32 = 254;

/// Default number of synthetic nodes
pub const DEFAULT_NODE_COUNT: u32 = 4;

/// Default lease renewal period, half the lease duration
pub const DEFAULT_LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(20);

/// Default capacity of controller event channels and lifecycle work queues
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Settings shared by the orchestrator, ledger and lifecycle simulator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    /// Number of statically bootstrapped nodes
    pub node_count: u32,
    /// Namespace holding node leases
    pub lease_namespace: String,
    /// Lease duration written on create
    pub lease_duration_secs: i32,
    /// How often every known node's lease is renewed
    pub lease_renew_interval: Duration,
    /// Capacity of each controller's event channel
    pub event_buffer_size: usize,
    /// Capacity of the admit and remove queues
    pub queue_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_count: DEFAULT_NODE_COUNT,
            lease_namespace: NODE_LEASE_NAMESPACE.to_string(),
            lease_duration_secs: NODE_LEASE_DURATION_SECS,
            lease_renew_interval: DEFAULT_LEASE_RENEW_INTERVAL,
            event_buffer_size: DEFAULT_BUFFER_SIZE,
            queue_capacity: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl AgentConfig {
    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 || self.node_count > MAX_NODE_COUNT {
            return Err(Error::validation_for_field(
                "nodeCount",
                format!("must be between 1 and {MAX_NODE_COUNT}, got {}", self.node_count),
            ));
        }
        if self.lease_namespace.is_empty() {
            return Err(Error::validation_for_field(
                "leaseNamespace",
                "must not be empty",
            ));
        }
        if self.lease_duration_secs <= 0 {
            return Err(Error::validation_for_field(
                "leaseDurationSecs",
                "must be positive",
            ));
        }
        if self.lease_renew_interval.is_zero() {
            return Err(Error::validation_for_field(
                "leaseRenewInterval",
                "must be non-zero",
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::validation_for_field(
                "eventBufferSize",
                "must be non-zero",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::validation_for_field("queueCapacity", "must be non-zero"));
        }
        Ok(())
    }
}
