//! Synthetic pod lifecycle
//!
//! Pods bound to a simulated node are moved straight to Running: every
//! container reports started and ready, the pod gets an address from the
//! node's pool and the standard conditions turn True. When a pod is deleted
//! its containers report Completed, the address goes back to the pool and
//! the pod object is removed with zero grace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus, Node, Pod,
    PodCondition, PodIP, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubesim_common::{Error, Result};

use crate::client::ClusterClient;
use crate::ipam::NetworkAllocator;
use crate::{Manager, NodeLifecycleSink, PodLifecycleSink};

/// Conditions a running pod reports
pub const POD_CONDITION_TYPES: [&str; 4] =
    ["Initialized", "Ready", "ContainersReady", "PodScheduled"];

/// Offset of the synthetic finish time from the moment of termination
const TERMINATION_DELAY_SECS: i64 = 30;

type WorkQueues = (mpsc::Receiver<Pod>, mpsc::Receiver<Pod>);

/// Drives pods on simulated nodes through Running and Succeeded
pub struct LifecycleSimulator {
    client: Arc<dyn ClusterClient>,
    allocators: DashMap<String, Arc<NetworkAllocator>>,
    admit_tx: mpsc::Sender<Pod>,
    remove_tx: mpsc::Sender<Pod>,
    // Taken by the first call to run
    queues: Mutex<Option<WorkQueues>>,
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

fn node_pod_cidr(node: &Node) -> Option<&str> {
    let spec = node.spec.as_ref()?;
    spec.pod_cidr
        .as_deref()
        .or_else(|| spec.pod_cidrs.as_ref()?.first().map(String::as_str))
        .filter(|c| !c.is_empty())
}

fn running_started_at(status: &ContainerStatus) -> Option<Time> {
    status.state.as_ref()?.running.as_ref()?.started_at.clone()
}

fn running_status(
    name: &str,
    image: Option<&str>,
    previous: Option<&ContainerStatus>,
    now: DateTime<Utc>,
) -> ContainerStatus {
    let started_at = previous
        .and_then(running_started_at)
        .unwrap_or(Time(now));
    ContainerStatus {
        name: name.to_string(),
        image: image.unwrap_or_default().to_string(),
        image_id: previous.map(|p| p.image_id.clone()).unwrap_or_default(),
        container_id: previous.and_then(|p| p.container_id.clone()),
        restart_count: previous.map(|p| p.restart_count).unwrap_or(0),
        ready: true,
        started: Some(true),
        state: Some(ContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(started_at),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn terminated_status(previous: &ContainerStatus, default_finish: &Time) -> ContainerStatus {
    let state = previous.state.as_ref();
    let finished_at = state
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.finished_at.clone())
        .unwrap_or_else(|| default_finish.clone());
    let started_at = state
        .and_then(|s| s.running.as_ref())
        .and_then(|r| r.started_at.clone())
        .or_else(|| state.and_then(|s| s.terminated.as_ref()?.started_at.clone()));

    ContainerStatus {
        name: previous.name.clone(),
        image: previous.image.clone(),
        image_id: previous.image_id.clone(),
        container_id: previous.container_id.clone(),
        restart_count: previous.restart_count,
        ready: false,
        started: Some(false),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 0,
                reason: Some("Completed".to_string()),
                started_at,
                finished_at: Some(finished_at),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// Transition times only move when a condition actually flips
fn set_conditions(status: &mut PodStatus, value: &str, now: DateTime<Utc>) {
    let previous = status.conditions.take().unwrap_or_default();
    let conditions = POD_CONDITION_TYPES
        .iter()
        .map(|type_| {
            let last_transition_time = previous
                .iter()
                .find(|c| c.type_ == *type_ && c.status == value)
                .and_then(|c| c.last_transition_time.clone())
                .unwrap_or(Time(now));
            PodCondition {
                type_: type_.to_string(),
                status: value.to_string(),
                last_transition_time: Some(last_transition_time),
                ..Default::default()
            }
        })
        .collect();
    status.conditions = Some(conditions);
}

/// Mark every declared container running and ready
fn start_containers(pod: &mut Pod, now: DateTime<Utc>) {
    let Some(spec) = pod.spec.as_ref() else {
        return;
    };
    let status = pod.status.get_or_insert_with(PodStatus::default);

    let previous: HashMap<String, ContainerStatus> = [
        status.init_container_statuses.take(),
        status.container_statuses.take(),
        status.ephemeral_container_statuses.take(),
    ]
    .into_iter()
    .flatten()
    .flatten()
    .map(|s| (s.name.clone(), s))
    .collect();

    let init: Vec<ContainerStatus> = spec
        .init_containers
        .iter()
        .flatten()
        .map(|c| running_status(&c.name, c.image.as_deref(), previous.get(&c.name), now))
        .collect();
    let regular: Vec<ContainerStatus> = spec
        .containers
        .iter()
        .map(|c| running_status(&c.name, c.image.as_deref(), previous.get(&c.name), now))
        .collect();
    let ephemeral: Vec<ContainerStatus> = spec
        .ephemeral_containers
        .iter()
        .flatten()
        .map(|c| running_status(&c.name, c.image.as_deref(), previous.get(&c.name), now))
        .collect();

    status.init_container_statuses = (!init.is_empty()).then_some(init);
    status.container_statuses = (!regular.is_empty()).then_some(regular);
    status.ephemeral_container_statuses = (!ephemeral.is_empty()).then_some(ephemeral);
}

/// Mark every reported container as completed
fn terminate_containers(status: &mut PodStatus, now: DateTime<Utc>) {
    let default_finish = Time(now + chrono::Duration::seconds(TERMINATION_DELAY_SECS));
    for list in [
        &mut status.init_container_statuses,
        &mut status.container_statuses,
        &mut status.ephemeral_container_statuses,
    ] {
        if let Some(statuses) = list.as_mut() {
            for s in statuses.iter_mut() {
                *s = terminated_status(s, &default_finish);
            }
        }
    }
}

fn set_ip(status: &mut PodStatus, ip: String) {
    status.pod_ips = Some(vec![PodIP { ip: ip.clone() }]);
    status.pod_ip = Some(ip);
}

fn current_ip(status: &PodStatus) -> Option<String> {
    status
        .pod_ip
        .clone()
        .filter(|ip| !ip.is_empty())
        .or_else(|| status.pod_ips.as_ref()?.first().map(|p| p.ip.clone()))
        .filter(|ip| !ip.is_empty())
}

impl LifecycleSimulator {
    /// Create a simulator with admit and remove queues of `queue_capacity`
    pub fn new(client: Arc<dyn ClusterClient>, queue_capacity: usize) -> Self {
        let (admit_tx, admit_rx) = mpsc::channel(queue_capacity.max(1));
        let (remove_tx, remove_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            client,
            allocators: DashMap::new(),
            admit_tx,
            remove_tx,
            queues: Mutex::new(Some((admit_rx, remove_rx))),
        }
    }

    /// The address pool of a node, if it has one
    pub fn allocator(&self, node_name: &str) -> Option<Arc<NetworkAllocator>> {
        self.allocators.get(node_name).map(|a| a.value().clone())
    }

    // A pod without a pool, or on a full one, runs without an address
    fn assign_ip(&self, pod: &mut Pod) {
        let node = pod_node(pod).map(str::to_string);
        let key = pod_key(pod);
        let status = pod.status.get_or_insert_with(PodStatus::default);

        if let Some(ip) = current_ip(status) {
            set_ip(status, ip);
            return;
        }
        let Some(allocator) = node.as_deref().and_then(|n| self.allocator(n)) else {
            debug!(pod = %key, "no address pool for node, pod left without IP");
            return;
        };
        match allocator.allocate() {
            Ok(ip) => {
                debug!(pod = %key, ip = %ip, "pod address allocated");
                set_ip(status, ip.to_string());
            }
            Err(e) => warn!(pod = %key, error = %e, "no address for pod, running without IP"),
        }
    }

    fn release_ip(&self, pod: &mut Pod) {
        let node = pod_node(pod).map(str::to_string);
        let key = pod_key(pod);
        let Some(status) = pod.status.as_mut() else {
            return;
        };
        if let (Some(ip), Some(allocator)) = (
            current_ip(status),
            node.as_deref().and_then(|n| self.allocator(n)),
        ) {
            if let Err(e) = allocator.release(&ip) {
                warn!(pod = %key, ip = %ip, error = %e, "failed to release pod address");
            }
        }
        status.pod_ip = None;
        status.pod_ips = None;
    }

    /// Bring a pod to Running and persist its status when it changed
    pub async fn start_pod(&self, pod: &mut Pod) -> Result<()> {
        let stored = pod.status.clone();
        let now = Utc::now();

        start_containers(pod, now);
        self.assign_ip(pod);
        let status = pod.status.get_or_insert_with(PodStatus::default);
        if status.start_time.is_none() {
            status.start_time = Some(Time(now));
        }
        set_conditions(status, "True", now);
        status.phase = Some("Running".to_string());

        if pod.status == stored {
            debug!(pod = %pod_key(pod), "pod status unchanged, skipping write");
            return Ok(());
        }
        self.client.update_pod_status(pod).await?;
        info!(pod = %pod_key(pod), node = pod_node(pod).unwrap_or_default(), "pod running");
        Ok(())
    }

    /// Complete a pod's containers, free its address and delete it
    pub async fn stop_pod(&self, pod: &mut Pod) -> Result<()> {
        let now = Utc::now();
        let status = pod.status.get_or_insert_with(PodStatus::default);
        terminate_containers(status, now);
        set_conditions(status, "False", now);
        self.release_ip(pod);
        if let Some(status) = pod.status.as_mut() {
            status.phase = Some("Succeeded".to_string());
        }

        self.client.delete_pod(pod, 0).await?;
        info!(pod = %pod_key(pod), "pod completed and deleted");
        Ok(())
    }

    async fn enqueue(&self, queue: &mpsc::Sender<Pod>, pod: Pod) -> Result<()> {
        queue
            .send(pod)
            .await
            .map_err(|_| Error::internal_with_context("lifecycle", "work queue closed"))
    }

    /// Run the start sequence and queue the pod for another pass
    ///
    /// Local state such as the assigned address is kept when the status write
    /// fails. A transient failure queues the pod as stored plus its address,
    /// so the drain writes the status again.
    async fn admit(&self, pod: &Pod) -> Result<()> {
        let mut started = pod.clone();
        let result = self.start_pod(&mut started).await;
        let queued = match &result {
            Err(e) if e.is_retryable() => {
                let mut retry = pod.clone();
                if let Some(ip) = started.status.as_ref().and_then(current_ip) {
                    set_ip(retry.status.get_or_insert_with(PodStatus::default), ip);
                }
                retry
            }
            _ => started,
        };
        self.enqueue(&self.admit_tx, queued).await?;
        result
    }

    /// Run the stop sequence and queue the pod for another pass
    async fn remove(&self, pod: &Pod) -> Result<()> {
        let mut stopped = pod.clone();
        let result = self.stop_pod(&mut stopped).await;
        self.enqueue(&self.remove_tx, stopped).await?;
        result
    }
}

#[async_trait]
impl PodLifecycleSink for LifecycleSimulator {
    async fn on_pod_add(&self, pod: &Pod) -> Result<()> {
        self.admit(pod).await
    }

    async fn on_pod_update(&self, pod: &Pod) -> Result<()> {
        self.admit(pod).await
    }

    async fn on_pod_delete(&self, pod: &Pod) -> Result<()> {
        self.remove(pod).await
    }
}

#[async_trait]
impl NodeLifecycleSink for LifecycleSimulator {
    async fn on_node_add(&self, node: &Node) -> Result<()> {
        let name = node.name_any();
        if self.allocators.contains_key(&name) {
            return Ok(());
        }
        let Some(cidr) = node_pod_cidr(node) else {
            debug!(node = %name, "node has no pod CIDR, no address pool");
            return Ok(());
        };
        let allocator = NetworkAllocator::new(cidr)?;
        info!(node = %name, cidr, capacity = allocator.capacity(), "address pool created");
        self.allocators
            .entry(name)
            .or_insert_with(|| Arc::new(allocator));
        Ok(())
    }

    async fn on_node_update(&self, _node: &Node) -> Result<()> {
        Ok(())
    }

    async fn on_node_delete(&self, node: &Node) -> Result<()> {
        if self.allocators.remove(&node.name_any()).is_some() {
            info!(node = %node.name_any(), "address pool discarded");
        }
        Ok(())
    }
}

#[async_trait]
impl Manager for LifecycleSimulator {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let Some((mut admit_rx, mut remove_rx)) = self.queues.lock().take() else {
            return Err(Error::internal_with_context(
                "lifecycle",
                "work queues already taken",
            ));
        };

        info!("lifecycle loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("lifecycle loop stopped");
                    return Ok(());
                }
                Some(mut pod) = remove_rx.recv() => {
                    let key = pod_key(&pod);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(pod = %key, "lifecycle loop stopped mid-stop");
                            return Ok(());
                        }
                        result = self.stop_pod(&mut pod) => {
                            if let Err(e) = result {
                                warn!(pod = %key, error = %e, "stop sequence failed");
                            }
                        }
                    }
                }
                Some(mut pod) = admit_rx.recv() => {
                    let key = pod_key(&pod);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(pod = %key, "lifecycle loop stopped mid-start");
                            return Ok(());
                        }
                        result = self.start_pod(&mut pod) => {
                            if let Err(e) = result {
                                warn!(pod = %key, error = %e, "start sequence failed");
                            }
                        }
                    }
                }
            }
        }
    }
}
