//! OCI resource models
//!
//! Only the fields the controller reads or writes are modelled. Unknown
//! fields in API responses are ignored, so equality on these types compares
//! exactly what the reconcilers own.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_TCP: &str = "6";
pub const PROTOCOL_UDP: &str = "17";

// ── load balancer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub compartment_id: String,
    #[serde(default)]
    pub shape_name: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub backend_sets: BTreeMap<String, BackendSet>,
    #[serde(default)]
    pub listeners: BTreeMap<String, Listener>,
    #[serde(default)]
    pub certificates: BTreeMap<String, Certificate>,
    #[serde(default)]
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAddress {
    pub ip_address: String,
    #[serde(default)]
    pub is_public: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancerDetails {
    pub compartment_id: String,
    pub display_name: String,
    pub shape_name: String,
    pub subnet_ids: Vec<String>,
    pub is_private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSet {
    pub name: String,
    pub policy: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
    pub health_checker: HealthChecker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub ip_address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecker {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub default_backend_set_name: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_configuration: Option<SslConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_configuration: Option<ConnectionConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslConfiguration {
    pub certificate_name: String,
    pub verify_depth: u32,
    pub verify_peer_certificate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfiguration {
    pub idle_timeout: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub certificate_name: String,
    #[serde(default)]
    pub public_certificate: String,
    #[serde(default)]
    pub ca_certificate: Option<String>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDetails {
    pub certificate_name: String,
    pub public_certificate: String,
    pub private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for CertificateDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateDetails")
            .field("certificate_name", &self.certificate_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkRequestState {
    Accepted,
    InProgress,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequestError {
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub id: String,
    #[serde(default)]
    pub load_balancer_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub lifecycle_state: WorkRequestState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_details: Vec<WorkRequestError>,
}

impl WorkRequest {
    /// Human readable failure cause.
    pub fn failure_message(&self) -> String {
        let details: Vec<&str> = self
            .error_details
            .iter()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
            .collect();
        if details.is_empty() {
            self.message.clone()
        } else {
            details.join("; ")
        }
    }
}

// ── networking ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub vcn_id: String,
    pub cidr_block: String,
    #[serde(default)]
    pub availability_domain: Option<String>,
    #[serde(default)]
    pub security_list_ids: Vec<String>,
    #[serde(default)]
    pub route_table_id: String,
    #[serde(default)]
    pub dns_label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            min: port,
            max: port,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port_range: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port_range: Option<PortRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSecurityRule {
    pub source: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_options: Option<PortOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_options: Option<PortOptions>,
    #[serde(default)]
    pub is_stateless: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressSecurityRule {
    pub destination: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_options: Option<PortOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_options: Option<PortOptions>,
    #[serde(default)]
    pub is_stateless: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityList {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub vcn_id: String,
    #[serde(default)]
    pub ingress_security_rules: Vec<IngressSecurityRule>,
    #[serde(default)]
    pub egress_security_rules: Vec<EgressSecurityRule>,
    #[serde(default)]
    pub time_created: Option<DateTime<Utc>>,
    /// Version token from the `etag` response header.
    #[serde(skip)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSecurityListDetails {
    pub ingress_security_rules: Vec<IngressSecurityRule>,
    pub egress_security_rules: Vec<EgressSecurityRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateIp {
    pub id: String,
    pub ip_address: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub vnic_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(default)]
    pub destination: String,
    #[serde(default = "default_destination_type")]
    pub destination_type: String,
    pub network_entity_id: String,
}

fn default_destination_type() -> String {
    "CIDR_BLOCK".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTable {
    pub id: String,
    #[serde(default)]
    pub vcn_id: String,
    #[serde(default)]
    pub route_rules: Vec<RouteRule>,
    #[serde(skip)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vnic {
    pub id: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub hostname_label: Option<String>,
    #[serde(default)]
    pub is_primary: Option<bool>,
}

// ── compute ─────────────────────────────────────────────────────────────────

pub const INSTANCE_TERMINATING: &str = "TERMINATING";
pub const INSTANCE_TERMINATED: &str = "TERMINATED";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub compartment_id: String,
    #[serde(default)]
    pub availability_domain: String,
    #[serde(default)]
    pub shape: String,
    #[serde(default)]
    pub region: String,
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VnicAttachment {
    pub id: String,
    pub instance_id: String,
    #[serde(default)]
    pub vnic_id: Option<String>,
    pub lifecycle_state: String,
}

pub const VNIC_ATTACHMENT_ATTACHED: &str = "ATTACHED";

// ── block storage ───────────────────────────────────────────────────────────

pub const VOLUME_AVAILABLE: &str = "AVAILABLE";
pub const VOLUME_FAULTY: &str = "FAULTY";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub compartment_id: String,
    #[serde(default)]
    pub availability_domain: String,
    #[serde(default, rename = "sizeInMBs")]
    pub size_in_mbs: i64,
    pub lifecycle_state: String,
}

/// Seed data for a new volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VolumeSourceDetails {
    VolumeBackup { id: String },
    Volume { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeDetails {
    pub availability_domain: String,
    pub compartment_id: String,
    pub display_name: String,
    #[serde(rename = "sizeInMBs")]
    pub size_in_mbs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_details: Option<VolumeSourceDetails>,
}

// ── file storage ────────────────────────────────────────────────────────────

pub const FSS_ACTIVE: &str = "ACTIVE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystem {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub compartment_id: String,
    #[serde(default)]
    pub availability_domain: String,
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileSystemDetails {
    pub availability_domain: String,
    pub compartment_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Export {
    pub id: String,
    pub export_set_id: String,
    pub file_system_id: String,
    pub path: String,
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExportDetails {
    pub export_set_id: String,
    pub file_system_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountTarget {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub compartment_id: String,
    #[serde(default)]
    pub availability_domain: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub private_ip_ids: Vec<String>,
    #[serde(default)]
    pub export_set_id: Option<String>,
    pub lifecycle_state: String,
}

// ── identity ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityDomain {
    pub name: String,
    #[serde(default)]
    pub compartment_id: String,
}

/// Error body returned by every OCI service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_set_ignores_unmodelled_fields() {
        let json = r#"{
            "name": "TCP-80",
            "policy": "ROUND_ROBIN",
            "backends": [{"name": "10.0.0.1:30080", "ipAddress": "10.0.0.1", "port": 30080,
                          "weight": 1, "backup": false, "drain": false, "offline": false}],
            "healthChecker": {"protocol": "HTTP", "urlPath": "/healthz", "port": 10256,
                              "retries": 3, "timeoutInMillis": 3000, "intervalInMillis": 10000}
        }"#;
        let bs: BackendSet = serde_json::from_str(json).unwrap();
        assert_eq!(bs.backends[0].ip_address, "10.0.0.1");
        assert_eq!(bs.health_checker.url_path.as_deref(), Some("/healthz"));
    }

    #[test]
    fn test_volume_source_details_tagging() {
        let src = VolumeSourceDetails::VolumeBackup {
            id: "ocid1.volumebackup.oc1..x".to_string(),
        };
        let v = serde_json::to_value(&src).unwrap();
        assert_eq!(v["type"], "volumeBackup");
        assert_eq!(v["id"], "ocid1.volumebackup.oc1..x");
    }

    #[test]
    fn test_work_request_failure_message() {
        let wr = WorkRequest {
            id: "wr".to_string(),
            load_balancer_id: String::new(),
            kind: "CreateListener".to_string(),
            lifecycle_state: WorkRequestState::Failed,
            message: "generic".to_string(),
            error_details: vec![WorkRequestError {
                error_code: "BAD_INPUT".to_string(),
                message: "port already in use".to_string(),
            }],
        };
        assert_eq!(wr.failure_message(), "port already in use");

        let bare = WorkRequest {
            error_details: vec![],
            ..wr
        };
        assert_eq!(bare.failure_message(), "generic");
    }

    #[test]
    fn test_security_list_etag_not_serialized() {
        let sl = SecurityList {
            id: "sl".to_string(),
            etag: Some("v1".to_string()),
            ..Default::default()
        };
        let v = serde_json::to_value(&sl).unwrap();
        assert!(v.get("etag").is_none());
    }
}
