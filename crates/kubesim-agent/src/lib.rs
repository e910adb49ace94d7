//! kubesim agent - a simulated kubelet fleet
//!
//! Registers synthetic nodes with a real control plane and keeps them alive:
//!
//! - **Controllers**: watch Nodes and Pods, emit classified events
//! - **Ledger**: per-node capacity accounting and lease renewal
//! - **Lifecycle**: drives scheduled pods to Running, then Succeeded on delete
//! - **Orchestrator**: bootstraps the fleet and routes events
//!
//! No container ever runs; pod state is written straight to the apiserver.

#![deny(missing_docs)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use tokio_util::sync::CancellationToken;

use kubesim_common::Result;

pub mod client;
pub mod config;
pub mod controller;
pub mod ipam;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;

pub use client::{ClusterClient, KubeClusterClient};
pub use config::AgentConfig;
pub use controller::{EventController, EventOp, NodeEvent, PodEvent, WatchEvent};
pub use ipam::NetworkAllocator;
pub use ledger::ResourceLedger;
pub use lifecycle::LifecycleSimulator;
pub use orchestrator::Orchestrator;

/// Receives pod changes routed by the dispatch loop
#[async_trait]
pub trait PodLifecycleSink: Send + Sync {
    /// A pod was scheduled to a node
    async fn on_pod_add(&self, pod: &Pod) -> Result<()>;

    /// A scheduled pod changed
    async fn on_pod_update(&self, pod: &Pod) -> Result<()>;

    /// A pod is terminating or gone
    async fn on_pod_delete(&self, pod: &Pod) -> Result<()>;
}

/// Receives node changes routed by the dispatch loop
#[async_trait]
pub trait NodeLifecycleSink: Send + Sync {
    /// A node appeared
    async fn on_node_add(&self, node: &Node) -> Result<()>;

    /// A node changed
    async fn on_node_update(&self, node: &Node) -> Result<()>;

    /// A node was removed
    async fn on_node_delete(&self, node: &Node) -> Result<()>;
}

/// A sink for both kinds that also owns a background loop
#[async_trait]
pub trait Manager: PodLifecycleSink + NodeLifecycleSink {
    /// Run the background loop until `cancel` fires
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}
