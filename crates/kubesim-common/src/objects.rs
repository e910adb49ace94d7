//! Builders for the synthetic objects the agent registers
//!
//! Nodes are reported as healthy 4-core / 16Gi machines. Leases follow the
//! kubelet's node-lease shape: one per node, held by the node itself.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};

use crate::HOSTNAME_LABEL_KEY;

/// Name of the i-th statically bootstrapped node
pub fn static_node_name(index: usize) -> String {
    format!("{}-{}", crate::STATIC_NODE_PREFIX, index)
}

/// Host address of the i-th statically bootstrapped node
pub fn static_host_ip(index: usize) -> String {
    format!("10.10.10.{}", index + 1)
}

/// Pod CIDR of the i-th statically bootstrapped node
pub fn static_pod_cidr(index: usize) -> String {
    format!("10.244.{}.0/24", index + 1)
}

fn resource_list(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn node_condition(type_: &str, status: &str, reason: &str, message: &str) -> NodeCondition {
    let now = Time(Utc::now());
    NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Build a ready synthetic node with the given internal address and pod CIDR
pub fn new_node_object(name: &str, internal_ip: &str, pod_cidr: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                HOSTNAME_LABEL_KEY.to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            pod_cidr: Some(pod_cidr.to_string()),
            pod_cidrs: Some(vec![pod_cidr.to_string()]),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            addresses: Some(vec![
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: internal_ip.to_string(),
                },
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: name.to_string(),
                },
            ]),
            node_info: Some(NodeSystemInfo {
                machine_id: "machine-id-123".to_string(),
                system_uuid: "system-uuid-456".to_string(),
                boot_id: "boot-id-789".to_string(),
                kernel_version: "5.4.0".to_string(),
                os_image: "Ubuntu 20.04".to_string(),
                container_runtime_version: "docker://19.3.12".to_string(),
                kubelet_version: "v1.20.0".to_string(),
                kube_proxy_version: "v1.20.0".to_string(),
                operating_system: "linux".to_string(),
                architecture: "amd64".to_string(),
                ..Default::default()
            }),
            capacity: Some(resource_list(&[
                ("cpu", "4"),
                ("memory", "16Gi"),
                ("ephemeral-storage", "100Gi"),
                ("pods", "110"),
            ])),
            allocatable: Some(resource_list(&[
                ("cpu", "3800m"),
                ("memory", "15.5Gi"),
                ("ephemeral-storage", "95Gi"),
                ("pods", "110"),
            ])),
            conditions: Some(vec![
                node_condition(
                    "Ready",
                    "True",
                    "KubeletReady",
                    "kubelet is posting ready status",
                ),
                node_condition(
                    "MemoryPressure",
                    "False",
                    "KubeletHasSufficientMemory",
                    "kubelet has sufficient memory available",
                ),
                node_condition(
                    "DiskPressure",
                    "False",
                    "KubeletHasNoDiskPressure",
                    "kubelet has no disk pressure",
                ),
                node_condition(
                    "PIDPressure",
                    "False",
                    "KubeletHasSufficientPID",
                    "kubelet has sufficient PID available",
                ),
            ]),
            ..Default::default()
        }),
    }
}

/// Build a node lease held by `node_name`, renewed now
pub fn new_lease_object(node_name: &str, namespace: &str, duration_secs: i32) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(node_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(node_name.to_string()),
            lease_duration_seconds: Some(duration_secs),
            renew_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        }),
    }
}

/// Move a lease's renew time to now, leaving everything else as fetched
pub fn renew_lease(lease: &mut Lease) {
    lease.spec.get_or_insert_with(LeaseSpec::default).renew_time = Some(MicroTime(Utc::now()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_naming_is_deterministic() {
        assert_eq!(static_node_name(0), "mock-node-0");
        assert_eq!(static_host_ip(0), "10.10.10.1");
        assert_eq!(static_pod_cidr(0), "10.244.1.0/24");
        assert_eq!(static_node_name(7), "mock-node-7");
        assert_eq!(static_pod_cidr(7), "10.244.8.0/24");
    }

    #[test]
    fn node_object_reports_capacity_and_addresses() {
        let node = new_node_object("mock-node-0", "10.10.10.1", "10.244.1.0/24");
        assert_eq!(node.metadata.name.as_deref(), Some("mock-node-0"));
        assert_eq!(
            node.metadata.labels.as_ref().unwrap()[HOSTNAME_LABEL_KEY],
            "mock-node-0"
        );
        assert_eq!(
            node.spec.as_ref().unwrap().pod_cidr.as_deref(),
            Some("10.244.1.0/24")
        );

        let status = node.status.as_ref().unwrap();
        let capacity = status.capacity.as_ref().unwrap();
        assert_eq!(capacity["cpu"].0, "4");
        assert_eq!(capacity["memory"].0, "16Gi");
        assert_eq!(capacity["pods"].0, "110");
        assert_eq!(status.allocatable.as_ref().unwrap()["cpu"].0, "3800m");

        let addresses = status.addresses.as_ref().unwrap();
        assert!(addresses
            .iter()
            .any(|a| a.type_ == "InternalIP" && a.address == "10.10.10.1"));
    }

    #[test]
    fn node_object_is_ready_without_pressure() {
        let node = new_node_object("n", "10.10.10.1", "10.244.1.0/24");
        let conditions = node.status.unwrap().conditions.unwrap();
        assert_eq!(conditions.len(), 4);
        for c in &conditions {
            let expected = if c.type_ == "Ready" { "True" } else { "False" };
            assert_eq!(c.status, expected, "condition {}", c.type_);
        }
    }

    #[test]
    fn node_object_serializes_with_camel_case_cidr() {
        let node = new_node_object("n", "10.10.10.1", "10.244.1.0/24");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["spec"]["podCIDR"], "10.244.1.0/24");
    }

    #[test]
    fn lease_object_is_held_by_node() {
        let lease = new_lease_object("mock-node-1", "kube-node-lease", 40);
        assert_eq!(lease.metadata.namespace.as_deref(), Some("kube-node-lease"));
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("mock-node-1"));
        assert_eq!(spec.lease_duration_seconds, Some(40));
        assert!(spec.renew_time.is_some());
    }

    #[test]
    fn renew_moves_time_forward() {
        let mut lease = new_lease_object("n", "kube-node-lease", 40);
        let before = lease.spec.as_ref().unwrap().renew_time.clone().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        renew_lease(&mut lease);
        let after = lease.spec.as_ref().unwrap().renew_time.clone().unwrap();
        assert!(after.0 > before.0);
        assert_eq!(lease.spec.unwrap().lease_duration_seconds, Some(40));
    }

    #[test]
    fn renew_fills_missing_spec() {
        let mut lease = Lease::default();
        renew_lease(&mut lease);
        assert!(lease.spec.unwrap().renew_time.is_some());
    }
}
