//! Load balancer lifecycle replayed against the in-memory cloud.
//!
//! Run with: cargo test --test load_balancer_scenarios

mod common;

use common::*;
use k8s_openapi::api::core::v1::Service;
use oci_ccm::cloudprovider::load_balancer_spec::{
    ANNOTATION_LB_SSL_PORTS, ANNOTATION_LB_TLS_SECRET,
};
use oci_ccm::oci::fake::FAKE_LB_IP;

fn plain_service() -> Service {
    service(&[(80, 30080)])
}

fn tls_service() -> Service {
    let svc = service(&[(80, 30080), (443, 30443)]);
    let svc = annotate(svc, ANNOTATION_LB_SSL_PORTS, "443");
    annotate(svc, ANNOTATION_LB_TLS_SECRET, "tls")
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} not in {calls:?}"))
}

#[tokio::test]
async fn load_balancer_lifecycle() {
    let h = load_balancer_harness();
    let nodes = [worker_node()];

    // Create from nothing.
    let status = h
        .provider
        .ensure_load_balancer(CLUSTER, &plain_service(), &nodes)
        .await
        .unwrap();
    assert_eq!(
        lb_calls(&h.cloud),
        vec![
            "CreateLoadBalancer test-uid",
            "CreateBackendSet TCP-80",
            "CreateListener TCP-80",
        ]
    );
    assert_eq!(status.ingress.unwrap()[0].ip.as_deref(), Some(FAKE_LB_IP));
    let lb = h.cloud.load_balancer_by_name(SERVICE_UID).unwrap();
    assert_eq!(lb.shape_name, "100Mbps");
    assert_eq!(lb.subnet_ids, vec!["subnet1", "subnet2"]);
    let backends = &lb.backend_sets["TCP-80"].backends;
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].ip_address, NODE_IP);
    assert_eq!(backends[0].port, 30080);
    assert_eq!(ingress_ports(&h.cloud, "lb1"), vec![80]);
    assert_eq!(ingress_ports(&h.cloud, "lb2"), vec![80]);
    assert_eq!(
        ingress_sources(&h.cloud, "node"),
        vec!["10.0.1.0/24", "10.0.1.0/24", "10.0.2.0/24", "10.0.2.0/24"]
    );
    assert_eq!(ingress_ports(&h.cloud, "node"), vec![10256, 10256, 30080, 30080]);

    let (_, exists) = h
        .provider
        .get_load_balancer(CLUSTER, &plain_service())
        .await
        .unwrap();
    assert!(exists);

    // Add a TLS port.
    h.cloud.clear_calls();
    h.provider
        .ensure_load_balancer(CLUSTER, &tls_service(), &nodes)
        .await
        .unwrap();
    let calls = lb_calls(&h.cloud);
    assert!(calls.contains(&"CreateCertificate test-uid".to_string()));
    assert!(
        position(&calls, "CreateBackendSet TCP-443")
            < position(&calls, "CreateListener TCP-443-test-uid")
    );
    assert_eq!(ingress_ports(&h.cloud, "lb1"), vec![80, 443]);

    // Drop it again.
    h.cloud.clear_calls();
    h.provider
        .ensure_load_balancer(CLUSTER, &plain_service(), &nodes)
        .await
        .unwrap();
    let calls = lb_calls(&h.cloud);
    assert!(
        position(&calls, "DeleteListener TCP-443-test-uid")
            < position(&calls, "DeleteBackendSet TCP-443")
    );
    assert_eq!(ingress_ports(&h.cloud, "lb1"), vec![80]);
    assert_eq!(ingress_ports(&h.cloud, "lb2"), vec![80]);
    let lb = h.cloud.load_balancer_by_name(SERVICE_UID).unwrap();
    assert!(lb.listeners.contains_key("TCP-80"));
    assert!(!lb.backend_sets.contains_key("TCP-443"));

    // Tear down.
    h.cloud.clear_calls();
    h.provider
        .ensure_load_balancer_deleted(CLUSTER, &plain_service())
        .await
        .unwrap();
    let calls = h.cloud.calls();
    assert_eq!(
        calls.last().map(String::as_str),
        Some("DeleteLoadBalancer test-uid")
    );
    assert!(calls[..calls.len() - 1]
        .iter()
        .all(|c| c.starts_with("UpdateSecurityList")));
    assert!(h.cloud.load_balancer_by_name(SERVICE_UID).is_none());
    assert!(ingress_ports(&h.cloud, "lb1").is_empty());
    // Health-check rules on the shared kube-proxy port stay.
    assert_eq!(ingress_ports(&h.cloud, "node"), vec![10256, 10256]);

    h.cloud.clear_calls();
    h.provider
        .ensure_load_balancer_deleted(CLUSTER, &plain_service())
        .await
        .unwrap();
    assert!(h.cloud.calls().is_empty());

    let (_, exists) = h
        .provider
        .get_load_balancer(CLUSTER, &plain_service())
        .await
        .unwrap();
    assert!(!exists);
}

#[tokio::test]
async fn steady_state_reconcile_makes_no_calls() {
    let h = load_balancer_harness();
    let nodes = [worker_node()];
    h.provider
        .ensure_load_balancer(CLUSTER, &tls_service(), &nodes)
        .await
        .unwrap();

    h.cloud.clear_calls();
    h.provider
        .ensure_load_balancer(CLUSTER, &tls_service(), &nodes)
        .await
        .unwrap();
    assert!(h.cloud.calls().is_empty(), "calls: {:?}", h.cloud.calls());
}
