//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeSpec, NodeStatus, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    Service, ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use oci_ccm::cloudprovider::{
    new_security_list_manager, CloudLoadBalancerProvider, StaticSecretReader, TlsSecret,
};
use oci_ccm::config::{Config, LoadBalancerConfig};
use oci_ccm::oci::fake::created_at;
use oci_ccm::oci::types::{Instance, SecurityList, Subnet, Vnic};
use oci_ccm::oci::FakeCloud;

pub const CLUSTER: &str = "scenario-cluster";
pub const SERVICE_UID: &str = "test-uid";
pub const NODE_IP: &str = "10.0.10.5";

pub struct LoadBalancerHarness {
    pub cloud: Arc<FakeCloud>,
    pub provider: CloudLoadBalancerProvider,
}

fn subnet(id: &str, cidr: &str, list: &str) -> Subnet {
    Subnet {
        id: id.to_string(),
        vcn_id: "vcn".to_string(),
        cidr_block: cidr.to_string(),
        security_list_ids: vec![list.to_string()],
        ..Default::default()
    }
}

fn self_signed_secret() -> TlsSecret {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["shop.example.com".to_string()]).unwrap();
    TlsSecret {
        certificate: cert.pem(),
        private_key: key_pair.serialize_pem(),
        ca_certificate: None,
    }
}

/// Two LB subnets, one node subnet, one running instance and a `default/tls`
/// secret.
pub fn load_balancer_harness() -> LoadBalancerHarness {
    let cloud = Arc::new(FakeCloud::new());
    cloud.add_subnet(subnet("subnet1", "10.0.1.0/24", "lb1"));
    cloud.add_subnet(subnet("subnet2", "10.0.2.0/24", "lb2"));
    cloud.add_subnet(subnet("node-subnet", "10.0.10.0/24", "node"));
    for id in ["lb1", "lb2", "node"] {
        cloud.add_security_list(SecurityList {
            id: id.to_string(),
            time_created: created_at(1),
            ..Default::default()
        });
    }
    cloud.add_instance(
        Instance {
            id: "ocid1.instance.oc1.worker-1".to_string(),
            display_name: "worker-1".to_string(),
            lifecycle_state: "RUNNING".to_string(),
            ..Default::default()
        },
        Vnic {
            id: "vnic-worker-1".to_string(),
            subnet_id: "node-subnet".to_string(),
            private_ip: Some(NODE_IP.to_string()),
            is_primary: Some(true),
            ..Default::default()
        },
    );

    let config = Config {
        compartment: "compartment".to_string(),
        vcn: "vcn".to_string(),
        load_balancer: LoadBalancerConfig {
            subnet1: "subnet1".to_string(),
            subnet2: "subnet2".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let secrets = Arc::new(StaticSecretReader::new());
    secrets.insert("default", "tls", self_signed_secret());
    let security_lists = new_security_list_manager(cloud.clone(), &config.load_balancer);
    let provider =
        CloudLoadBalancerProvider::new(cloud.clone(), secrets, security_lists, &config, "");
    LoadBalancerHarness { cloud, provider }
}

pub fn service(ports: &[(i32, i32)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("shop".to_string()),
            namespace: Some("default".to_string()),
            uid: Some(SERVICE_UID.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, node_port)| ServicePort {
                        protocol: Some("TCP".to_string()),
                        port: *port,
                        node_port: Some(*node_port),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn annotate(mut service: Service, key: &str, value: &str) -> Service {
    service
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    service
}

pub fn worker_node() -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some("worker-1".to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some("oci://ocid1.instance.oc1.worker-1".to_string()),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: NODE_IP.to_string(),
            }]),
            ..Default::default()
        }),
    }
}

/// Load balancer calls, without the interleaved security-list updates.
pub fn lb_calls(cloud: &FakeCloud) -> Vec<String> {
    cloud
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("UpdateSecurityList"))
        .collect()
}

/// Destination ports opened on a security list's ingress rules, sorted.
pub fn ingress_ports(cloud: &FakeCloud, list: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = cloud
        .security_list(list)
        .map(|l| l.ingress_security_rules)
        .unwrap_or_default()
        .iter()
        .filter_map(|r| r.tcp_options.as_ref()?.destination_port_range.as_ref())
        .map(|r| r.min)
        .collect();
    ports.sort_unstable();
    ports
}

/// Ingress sources on a security list, sorted.
pub fn ingress_sources(cloud: &FakeCloud, list: &str) -> Vec<String> {
    let mut sources: Vec<String> = cloud
        .security_list(list)
        .map(|l| l.ingress_security_rules)
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.source)
        .collect();
    sources.sort();
    sources
}

pub fn claim(
    uid: &str,
    storage: &str,
    modes: &[&str],
    annotations: &[(&str, &str)],
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            namespace: Some("default".to_string()),
            uid: Some(uid.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(modes.iter().map(|m| m.to_string()).collect()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
