//! Cluster API access for the simulated agent
//!
//! Every write the agent makes to the control plane goes through
//! [`ClusterClient`], so ledger and lifecycle logic can be tested against a
//! mock without a cluster.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions};
use kube::config::KubeConfigOptions;
use kube::{Client, Config, ResourceExt};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubesim_common::{Error, Result};

/// Connection timeout for the apiserver
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for the apiserver; watches reconnect past it
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the agent performs against the control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a node by name, None when it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Register a node object
    async fn create_node(&self, node: &Node) -> Result<()>;

    /// Fetch the lease of a node, None when it does not exist
    async fn get_lease(&self, node_name: &str) -> Result<Option<Lease>>;

    /// Create a node lease
    async fn create_lease(&self, lease: &Lease) -> Result<()>;

    /// Replace an existing node lease
    async fn update_lease(&self, lease: &Lease) -> Result<()>;

    /// Persist the status block of a pod
    async fn update_pod_status(&self, pod: &Pod) -> Result<()>;

    /// Delete this exact pod; one that is already gone or replaced counts as deleted
    async fn delete_pod(&self, pod: &Pod, grace_period_secs: u32) -> Result<()>;
}

/// [`ClusterClient`] backed by a kube client
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    lease_namespace: String,
}

impl KubeClusterClient {
    /// Wrap a client; leases live in `lease_namespace`
    pub fn new(client: Client, lease_namespace: impl Into<String>) -> Self {
        Self {
            client,
            lease_namespace: lease_namespace.into(),
        }
    }

    fn leases(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.lease_namespace)
    }
}

/// Build a kube client from an explicit kubeconfig, or infer one
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path).map_err(|e| {
                Error::validation_for_field(
                    "kubeconfig",
                    format!("failed to read {}: {e}", path.display()),
                )
            })?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::validation_for_field("kubeconfig", e.to_string()))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::from(kube::Error::InferConfig(e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_node(&self, node: &Node) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.create(&PostParams::default(), node).await?;
        debug!(node = %node.name_any(), "node created");
        Ok(())
    }

    async fn get_lease(&self, node_name: &str) -> Result<Option<Lease>> {
        Ok(self.leases().get_opt(node_name).await?)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<()> {
        self.leases().create(&PostParams::default(), lease).await?;
        Ok(())
    }

    async fn update_lease(&self, lease: &Lease) -> Result<()> {
        self.leases()
            .replace(&lease.name_any(), &PostParams::default(), lease)
            .await?;
        Ok(())
    }

    async fn update_pod_status(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({ "status": pod.status });
        api.patch_status(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod, grace_period_secs: u32) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let params = delete_params(pod, grace_period_secs);
        let result = api.delete(&pod.name_any(), &params).await;
        absorb_gone(result.map(|_| ()).map_err(Error::from), &namespace, &pod.name_any())
    }
}

// Pinning the uid keeps a recreated pod of the same name safe from a stale delete
fn delete_params(pod: &Pod, grace_period_secs: u32) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(grace_period_secs),
        preconditions: pod.uid().map(|uid| Preconditions {
            uid: Some(uid),
            resource_version: None,
        }),
        ..Default::default()
    }
}

fn absorb_gone(result: Result<()>, namespace: &str, name: &str) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!(namespace, pod = name, "pod already deleted");
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            debug!(namespace, pod = name, "pod was replaced, delete skipped");
            Ok(())
        }
        other => other,
    }
}
