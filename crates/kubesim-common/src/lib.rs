//! Common types for kubesim: errors, telemetry, quantities and synthetic objects

#![deny(missing_docs)]

pub mod error;
pub mod objects;
pub mod quantity;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding per-node liveness leases (same as a real kubelet)
pub const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";

/// Lease duration advertised by every simulated node
pub const NODE_LEASE_DURATION_SECS: i32 = 40;

/// Name pattern for statically bootstrapped nodes, `{prefix}-{index}`
pub const STATIC_NODE_PREFIX: &str = "mock-node";

/// Label key carrying the node hostname
pub const HOSTNAME_LABEL_KEY: &str = "kubernetes.io/hostname";
