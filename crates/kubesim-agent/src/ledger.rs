//! Per-node resource accounting and lease renewal
//!
//! The ledger is the agent's view of how much of each synthetic node is
//! claimed by scheduled pods. Usage is tracked per pod so repeated updates
//! replace a pod's charge instead of adding to it. The ledger also owns the
//! node leases that tell the control plane the fleet is alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubesim_common::objects::{new_lease_object, renew_lease};
use kubesim_common::quantity::{cpu_millis, memory_bytes};
use kubesim_common::Result;

use crate::client::ClusterClient;
use crate::config::AgentConfig;
use crate::{Manager, NodeLifecycleSink, PodLifecycleSink};

/// Memory and cpu amounts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    /// Memory in bytes
    pub memory_bytes: u64,
    /// CPU in millicores
    pub cpu_millis: u64,
}

impl Resources {
    fn saturating_add(self, other: Resources) -> Resources {
        Resources {
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
        }
    }

    fn saturating_sub(self, other: Resources) -> Resources {
        Resources {
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
        }
    }
}

/// Sum of memory and cpu requests over a pod's regular containers
///
/// Containers without requests contribute nothing.
pub fn pod_requests(pod: &Pod) -> Result<Resources> {
    let containers = pod.spec.iter().flat_map(|s| s.containers.iter());
    let mut total = Resources::default();
    for container in containers {
        let Some(requests) = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
        else {
            continue;
        };
        if let Some(mem) = requests.get("memory") {
            total.memory_bytes = total.memory_bytes.saturating_add(memory_bytes(mem)?);
        }
        if let Some(cpu) = requests.get("cpu") {
            total.cpu_millis = total.cpu_millis.saturating_add(cpu_millis(cpu)?);
        }
    }
    Ok(total)
}

/// Capacity a node reports in `status.capacity`
pub fn node_capacity(node: &Node) -> Result<Resources> {
    let capacity = node.status.as_ref().and_then(|s| s.capacity.as_ref());
    let Some(capacity) = capacity else {
        return Ok(Resources::default());
    };
    Ok(Resources {
        memory_bytes: capacity.get("memory").map(memory_bytes).transpose()?.unwrap_or(0),
        cpu_millis: capacity.get("cpu").map(cpu_millis).transpose()?.unwrap_or(0),
    })
}

fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_default(),
        pod.name_any()
    )
}

fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

#[derive(Debug)]
struct NodeRecord {
    internal_ip: Option<String>,
    capacity: Resources,
    used: Resources,
    // Charge last applied for each pod, keyed by namespace/name
    charges: HashMap<String, Resources>,
}

impl NodeRecord {
    fn from_node(node: &Node) -> Self {
        Self {
            internal_ip: internal_ip(node),
            capacity: capacity_or_zero(node),
            used: Resources::default(),
            charges: HashMap::new(),
        }
    }

    fn charge(&mut self, key: String, amount: Resources) {
        if let Some(previous) = self.charges.insert(key, amount) {
            self.used = self.used.saturating_sub(previous);
        }
        self.used = self.used.saturating_add(amount);
    }

    fn discharge(&mut self, key: &str) -> Option<Resources> {
        let previous = self.charges.remove(key)?;
        self.used = self.used.saturating_sub(previous);
        Some(previous)
    }
}

fn capacity_or_zero(node: &Node) -> Resources {
    node_capacity(node).unwrap_or_else(|e| {
        warn!(node = %node.name_any(), error = %e, "unparseable node capacity, treating as zero");
        Resources::default()
    })
}

/// Point-in-time view of one node's accounting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeUsage {
    /// Node internal address, when reported
    pub internal_ip: Option<String>,
    /// Reported capacity
    pub capacity: Resources,
    /// Sum of charges of admitted pods
    pub used: Resources,
    /// Number of pods charged to the node
    pub pods: usize,
}

/// Node capacity ledger and lease keeper
pub struct ResourceLedger {
    client: Arc<dyn ClusterClient>,
    nodes: RwLock<HashMap<String, Arc<Mutex<NodeRecord>>>>,
    lease_namespace: String,
    lease_duration_secs: i32,
    renew_interval: Duration,
}

impl ResourceLedger {
    /// Create an empty ledger
    pub fn new(client: Arc<dyn ClusterClient>, config: &AgentConfig) -> Self {
        Self {
            client,
            nodes: RwLock::new(HashMap::new()),
            lease_namespace: config.lease_namespace.clone(),
            lease_duration_secs: config.lease_duration_secs,
            renew_interval: config.lease_renew_interval,
        }
    }

    fn record(&self, node_name: &str) -> Option<Arc<Mutex<NodeRecord>>> {
        self.nodes.read().get(node_name).cloned()
    }

    /// Names of all tracked nodes
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    /// Current accounting for a node
    pub fn usage(&self, node_name: &str) -> Option<NodeUsage> {
        let record = self.record(node_name)?;
        let record = record.lock();
        Some(NodeUsage {
            internal_ip: record.internal_ip.clone(),
            capacity: record.capacity,
            used: record.used,
            pods: record.charges.len(),
        })
    }

    /// Whether the pod's node can take its requests on top of current usage
    ///
    /// Strict: a pod that would fill the node exactly does not fit. Unknown
    /// nodes never fit.
    pub fn has_sufficient_resources(&self, pod: &Pod) -> bool {
        let Some(record) = pod_node(pod).and_then(|n| self.record(n)) else {
            return false;
        };
        let needed = match pod_requests(pod) {
            Ok(needed) => needed,
            Err(e) => {
                warn!(pod = %pod_key(pod), error = %e, "unparseable pod requests");
                return false;
            }
        };
        let record = record.lock();
        record.capacity.memory_bytes > record.used.memory_bytes.saturating_add(needed.memory_bytes)
            && record.capacity.cpu_millis > record.used.cpu_millis.saturating_add(needed.cpu_millis)
    }

    /// Create the node's lease, or move its renew time to now
    pub async fn renew_lease(&self, node_name: &str) -> Result<()> {
        match self.client.get_lease(node_name).await? {
            Some(mut lease) => {
                renew_lease(&mut lease);
                self.client.update_lease(&lease).await?;
                debug!(node = %node_name, "lease renewed");
            }
            None => {
                let lease =
                    new_lease_object(node_name, &self.lease_namespace, self.lease_duration_secs);
                self.client.create_lease(&lease).await?;
                info!(node = %node_name, namespace = %self.lease_namespace, "lease created");
            }
        }
        Ok(())
    }

    async fn renew_all(&self) {
        for name in self.node_names() {
            if let Err(e) = self.renew_lease(&name).await {
                warn!(node = %name, error = %e, "lease renewal failed");
            }
        }
    }

    fn charge_pod(&self, pod: &Pod) -> Result<()> {
        let Some(node_name) = pod_node(pod) else {
            return Ok(());
        };
        let Some(record) = self.record(node_name) else {
            debug!(node = %node_name, pod = %pod_key(pod), "pod on unknown node, not charged");
            return Ok(());
        };
        let amount = pod_requests(pod)?;
        record.lock().charge(pod_key(pod), amount);
        Ok(())
    }
}

#[async_trait]
impl PodLifecycleSink for ResourceLedger {
    async fn on_pod_add(&self, pod: &Pod) -> Result<()> {
        self.charge_pod(pod)
    }

    async fn on_pod_update(&self, pod: &Pod) -> Result<()> {
        self.charge_pod(pod)
    }

    async fn on_pod_delete(&self, pod: &Pod) -> Result<()> {
        let Some(record) = pod_node(pod).and_then(|n| self.record(n)) else {
            return Ok(());
        };
        let key = pod_key(pod);
        if record.lock().discharge(&key).is_none() {
            debug!(pod = %key, "pod was never charged");
        }
        Ok(())
    }
}

#[async_trait]
impl NodeLifecycleSink for ResourceLedger {
    async fn on_node_add(&self, node: &Node) -> Result<()> {
        let name = node.name_any();
        let inserted = {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&name) {
                false
            } else {
                nodes.insert(name.clone(), Arc::new(Mutex::new(NodeRecord::from_node(node))));
                true
            }
        };
        if !inserted {
            return Ok(());
        }
        info!(node = %name, "node tracked");
        if let Err(e) = self.renew_lease(&name).await {
            warn!(node = %name, error = %e, "failed to ensure node lease");
        }
        Ok(())
    }

    async fn on_node_update(&self, node: &Node) -> Result<()> {
        let name = node.name_any();
        let capacity = capacity_or_zero(node);
        let ip = internal_ip(node);
        let record = self
            .nodes
            .write()
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(NodeRecord::from_node(node))))
            .clone();
        let mut record = record.lock();
        record.capacity = capacity;
        if ip.is_some() {
            record.internal_ip = ip;
        }
        Ok(())
    }

    async fn on_node_delete(&self, node: &Node) -> Result<()> {
        if self.nodes.write().remove(&node.name_any()).is_some() {
            info!(node = %node.name_any(), "node untracked");
        }
        Ok(())
    }
}

#[async_trait]
impl Manager for ResourceLedger {
    /// Renew every tracked node's lease on a fixed tick
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let start = tokio::time::Instant::now() + self.renew_interval;
        let mut ticker = tokio::time::interval_at(start, self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.renew_interval, "lease renewal loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("lease renewal loop stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    // A stalled apiserver call must not hold up shutdown
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("lease renewal loop stopped mid-pass");
                            return Ok(());
                        }
                        _ = self.renew_all() => {}
                    }
                }
            }
        }
    }
}
