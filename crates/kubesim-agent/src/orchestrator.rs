//! Fleet bootstrap and event dispatch
//!
//! The orchestrator registers the static nodes, starts the watch controllers
//! and background loops, then routes every event to the ledger and the
//! lifecycle simulator from a single dispatch loop.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kubesim_common::objects::{new_node_object, static_host_ip, static_node_name, static_pod_cidr};
use kubesim_common::{Error, Result};

use crate::client::ClusterClient;
use crate::config::AgentConfig;
use crate::controller::{EventController, EventOp, NodeEvent, PodEvent, WatchedResource};
use crate::ledger::ResourceLedger;
use crate::lifecycle::LifecycleSimulator;
use crate::{Manager, NodeLifecycleSink, PodLifecycleSink};

/// Owns the ledger and simulator and wires them to the watch streams
pub struct Orchestrator {
    client: Arc<dyn ClusterClient>,
    ledger: Arc<ResourceLedger>,
    lifecycle: Arc<LifecycleSimulator>,
    config: AgentConfig,
}

fn spawn_controller<K: WatchedResource>(
    controller: EventController<K>,
    api: Api<K>,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = controller.run(api, cancel.clone()).await;
        match &result {
            Err(e) if e.is_cancelled() => debug!(kind = K::KIND, "controller stopped"),
            Err(e) => {
                error!(kind = K::KIND, error = %e, "controller failed, shutting down");
                cancel.cancel();
            }
            Ok(()) => {}
        }
        result
    })
}

fn spawn_manager<M: Manager + 'static>(
    name: &'static str,
    manager: Arc<M>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = manager.run(cancel).await {
            error!(manager = name, error = %e, "background loop failed");
        }
    })
}

impl Orchestrator {
    /// Build the ledger and simulator around a cluster client
    pub fn new(client: Arc<dyn ClusterClient>, config: AgentConfig) -> Self {
        let ledger = Arc::new(ResourceLedger::new(client.clone(), &config));
        let lifecycle = Arc::new(LifecycleSimulator::new(client.clone(), config.queue_capacity));
        Self {
            client,
            ledger,
            lifecycle,
            config,
        }
    }

    /// The resource ledger
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// The lifecycle simulator
    pub fn lifecycle(&self) -> &Arc<LifecycleSimulator> {
        &self.lifecycle
    }

    /// Register the static nodes with the cluster, the ledger and the simulator
    pub async fn bootstrap(&self) -> Result<()> {
        for index in 0..self.config.node_count as usize {
            let name = static_node_name(index);
            let node = match self.client.get_node(&name).await? {
                Some(existing) => {
                    debug!(node = %name, "node already registered");
                    existing
                }
                None => {
                    let node = new_node_object(&name, &static_host_ip(index), &static_pod_cidr(index));
                    self.client.create_node(&node).await?;
                    info!(node = %name, cidr = %static_pod_cidr(index), "node registered");
                    node
                }
            };

            // Also creates or renews the node's lease
            self.ledger.on_node_add(&node).await?;
            self.lifecycle.on_node_add(&node).await?;
        }
        info!(nodes = self.config.node_count, "fleet bootstrapped");
        Ok(())
    }

    /// Bootstrap, start watching and dispatch until cancelled
    ///
    /// Returns `Cancelled` on a clean shutdown. A failing controller cancels
    /// `cancel` itself and its error is returned instead.
    pub async fn run(&self, client: kube::Client, cancel: CancellationToken) -> Result<()> {
        self.bootstrap().await?;

        let (node_controller, node_rx) = EventController::<Node>::new(self.config.event_buffer_size);
        let (pod_controller, pod_rx) = EventController::<Pod>::new(self.config.event_buffer_size);

        let controllers = [
            spawn_controller(node_controller, Api::all(client.clone()), cancel.clone()),
            spawn_controller(pod_controller, Api::all(client), cancel.clone()),
        ];
        let managers = [
            spawn_manager("ledger", self.ledger.clone(), cancel.clone()),
            spawn_manager("lifecycle", self.lifecycle.clone(), cancel.clone()),
        ];

        let result = self.dispatch(node_rx, pod_rx, cancel.clone()).await;
        cancel.cancel();

        // A controller failure outranks the cancellation it caused
        let mut failure = None;
        for task in controllers {
            match task.await {
                Ok(Err(e)) if !e.is_cancelled() => {
                    failure.get_or_insert(e);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "controller task panicked"),
            }
        }
        for task in managers {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }
        match failure {
            Some(e) => Err(e),
            None => result,
        }
    }

    /// Route events until cancelled or both channels close
    pub async fn dispatch(
        &self,
        mut node_rx: mpsc::Receiver<NodeEvent>,
        mut pod_rx: mpsc::Receiver<PodEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut nodes_open = true;
        let mut pods_open = true;
        loop {
            if !nodes_open && !pods_open {
                return Err(Error::watch("dispatch", "all event channels closed"));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatch loop cancelled");
                    return Err(Error::cancelled("dispatch"));
                }
                event = node_rx.recv(), if nodes_open => match event {
                    Some(event) => self.handle_node_event(event).await,
                    None => nodes_open = false,
                },
                event = pod_rx.recv(), if pods_open => match event {
                    Some(event) => self.handle_pod_event(event).await,
                    None => pods_open = false,
                },
            }
        }
    }

    async fn handle_pod_event(&self, event: PodEvent) {
        let pod = &event.object;
        let key = format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any());
        debug!(pod = %key, op = ?event.op, "pod event");

        match event.op {
            EventOp::Added | EventOp::Updated => {
                if event.op == EventOp::Added && !self.ledger.has_sufficient_resources(pod) {
                    warn!(pod = %key, "node lacks capacity for pod, admitting anyway");
                }
                let admitted = if event.op == EventOp::Added {
                    self.lifecycle.on_pod_add(pod).await
                } else {
                    self.lifecycle.on_pod_update(pod).await
                };
                // The pod is bound to the node either way; the drain retries the write
                if let Err(e) = admitted {
                    warn!(pod = %key, error = %e, "pod start failed");
                }
                let charged = if event.op == EventOp::Added {
                    self.ledger.on_pod_add(pod).await
                } else {
                    self.ledger.on_pod_update(pod).await
                };
                if let Err(e) = charged {
                    warn!(pod = %key, error = %e, "failed to charge pod");
                }
            }
            EventOp::Deleted => {
                if let Err(e) = self.lifecycle.on_pod_delete(pod).await {
                    warn!(pod = %key, error = %e, "pod stop failed");
                }
                if let Err(e) = self.ledger.on_pod_delete(pod).await {
                    warn!(pod = %key, error = %e, "failed to release pod charge");
                }
            }
        }
    }

    async fn handle_node_event(&self, event: NodeEvent) {
        let node = &event.object;
        let name = node.name_any();
        debug!(node = %name, op = ?event.op, "node event");

        let (ledger, lifecycle) = match event.op {
            EventOp::Added => (
                self.ledger.on_node_add(node).await,
                self.lifecycle.on_node_add(node).await,
            ),
            EventOp::Updated => (
                self.ledger.on_node_update(node).await,
                self.lifecycle.on_node_update(node).await,
            ),
            EventOp::Deleted => (
                self.ledger.on_node_delete(node).await,
                self.lifecycle.on_node_delete(node).await,
            ),
        };
        if let Err(e) = ledger {
            warn!(node = %name, error = %e, "ledger rejected node event");
        }
        if let Err(e) = lifecycle {
            warn!(node = %name, error = %e, "lifecycle rejected node event");
        }
    }
}
