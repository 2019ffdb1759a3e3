//! Desired load balancer state for a Service
//!
//! [`LbSpec::new`] is a pure function of the Service, the backend addresses
//! and the provider defaults. Nothing here talks to the cloud.

use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Node, Service, ServicePort};
use kube::ResourceExt;
use tracing::warn;

use crate::error::{Error, Result};
use crate::oci::types::{
    Backend, BackendSet, ConnectionConfiguration, HealthChecker, Listener, SslConfiguration,
};
use crate::util::node_internal_ip;

pub const ANNOTATION_LB_INTERNAL: &str = "service.beta.kubernetes.io/oci-load-balancer-internal";
pub const ANNOTATION_LB_SHAPE: &str = "service.beta.kubernetes.io/oci-load-balancer-shape";
pub const ANNOTATION_LB_SUBNET1: &str = "service.beta.kubernetes.io/oci-load-balancer-subnet1";
pub const ANNOTATION_LB_SUBNET2: &str = "service.beta.kubernetes.io/oci-load-balancer-subnet2";
pub const ANNOTATION_LB_SSL_PORTS: &str = "service.beta.kubernetes.io/oci-load-balancer-ssl-ports";
pub const ANNOTATION_LB_TLS_SECRET: &str =
    "service.beta.kubernetes.io/oci-load-balancer-tls-secret";
pub const ANNOTATION_LB_BACKEND_PROTOCOL: &str =
    "service.beta.kubernetes.io/oci-load-balancer-backend-protocol";
pub const ANNOTATION_LB_CONNECTION_IDLE_TIMEOUT: &str =
    "service.beta.kubernetes.io/oci-load-balancer-connection-idle-timeout";
pub const ANNOTATION_LB_SOURCE_RANGES: &str =
    "service.beta.kubernetes.io/load-balancer-source-ranges";

pub const DEFAULT_LOAD_BALANCER_POLICY: &str = "ROUND_ROBIN";
pub const DEFAULT_SHAPE: &str = "100Mbps";
pub const DEFAULT_BACKEND_PROTOCOL: &str = "TCP";

pub const HEALTH_CHECK_PATH: &str = "/healthz";
/// kube-proxy health endpoint on every node.
pub const HEALTH_CHECK_PORT: u16 = 10256;
pub const HEALTH_CHECK_PROTOCOL_HTTP: &str = "HTTP";
pub const HEALTH_CHECK_PROTOCOL_TCP: &str = "TCP";

/// Environment variable holding the load balancer name prefix.
pub const LB_NAME_PREFIX_ENV: &str = "LOAD_BALANCER_PREFIX";
/// Longest display name the load balancer API accepts.
pub const MAX_LB_NAME_LENGTH: usize = 1024;

const ALLOW_ALL_CIDR: &str = "0.0.0.0/0";

/// Provider-level inputs to the spec builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecDefaults {
    pub name_prefix: String,
    pub subnet1: String,
    pub subnet2: String,
}

/// `{prefix}{uid}` with a trailing hyphen on a non-empty prefix.
pub fn get_load_balancer_name(prefix: &str, uid: &str) -> String {
    let mut name = String::with_capacity(prefix.len() + uid.len() + 1);
    name.push_str(prefix);
    if !prefix.is_empty() && !prefix.ends_with('-') {
        name.push('-');
    }
    name.push_str(uid);

    if name.chars().count() > MAX_LB_NAME_LENGTH {
        name = name.chars().take(MAX_LB_NAME_LENGTH).collect();
    }
    name
}

pub fn get_backend_set_name(protocol: &str, port: u16) -> String {
    format!("{protocol}-{port}")
}

pub fn get_listener_name(protocol: &str, port: u16, ssl: Option<&SslConfiguration>) -> String {
    match ssl {
        Some(ssl) => format!("{}-{}-{}", protocol, port, ssl.certificate_name),
        None => format!("{protocol}-{port}"),
    }
}

/// Ports listed in the SSL-ports annotation.
///
/// An entry that is not a port number disables SSL for the whole Service.
/// The error is logged, not returned.
pub fn get_ssl_enabled_ports(annotations: &BTreeMap<String, String>) -> BTreeSet<u16> {
    let Some(value) = annotations.get(ANNOTATION_LB_SSL_PORTS) else {
        return BTreeSet::new();
    };

    let mut ports = BTreeSet::new();
    for raw in value.split(',') {
        match raw.trim().parse::<u16>() {
            Ok(port) => {
                ports.insert(port);
            }
            Err(e) => {
                warn!(
                    "Ignoring {}={:?}: cannot parse {:?} as a port: {}",
                    ANNOTATION_LB_SSL_PORTS, value, raw, e
                );
                return BTreeSet::new();
            }
        }
    }
    ports
}

/// Split `[namespace/]name`. The namespace is `None` when absent.
pub fn parse_secret_string(value: &str) -> (Option<&str>, &str) {
    match value.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, value),
    }
}

/// Desired shape of one Service's load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbSpec {
    pub name: String,
    pub shape: String,
    pub subnets: [String; 2],
    pub backend_sets: BTreeMap<String, BackendSet>,
    pub listeners: BTreeMap<String, Listener>,
    pub source_cidrs: Vec<String>,
    pub ssl_ports: BTreeSet<u16>,
}

impl LbSpec {
    /// Build the spec for `service` with one backend per node.
    pub fn new(service: &Service, nodes: &[Node], defaults: &SpecDefaults) -> Result<Self> {
        validate_service(service)?;
        let backend_ips = nodes
            .iter()
            .map(node_internal_ip)
            .collect::<Result<Vec<_>>>()?;

        let annotations = service.annotations();
        let uid = service.uid().unwrap_or_default();
        let name = get_load_balancer_name(&defaults.name_prefix, &uid);

        let shape = annotations
            .get(ANNOTATION_LB_SHAPE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_SHAPE.to_string());

        let subnets = [
            annotations
                .get(ANNOTATION_LB_SUBNET1)
                .cloned()
                .unwrap_or_else(|| defaults.subnet1.clone()),
            annotations
                .get(ANNOTATION_LB_SUBNET2)
                .cloned()
                .unwrap_or_else(|| defaults.subnet2.clone()),
        ];
        if subnets.iter().any(String::is_empty) {
            return Err(Error::ConfigError(
                "a configuration for both load balancer subnets must be specified".to_string(),
            ));
        }

        let ssl_ports = get_ssl_enabled_ports(annotations);
        let ports = service_ports(service)?;
        let source_cidrs = get_load_balancer_source_ranges(service)?;
        let backend_sets = build_backend_sets(service, &ports, &backend_ips, &ssl_ports);
        let ssl_name = (!ssl_ports.is_empty()).then_some(name.as_str());
        let listeners = build_listeners(service, &ports, &ssl_ports, ssl_name)?;

        Ok(Self {
            name,
            shape,
            subnets,
            backend_sets,
            listeners,
            source_cidrs,
            ssl_ports,
        })
    }

    /// Certificate shared by every SSL listener, if any port terminates SSL.
    pub fn certificate_name(&self) -> Option<&str> {
        (!self.ssl_ports.is_empty()).then_some(self.name.as_str())
    }

    pub fn ssl_configuration(&self, port: u16) -> Option<SslConfiguration> {
        ssl_configuration(&self.ssl_ports, self.certificate_name(), port)
    }
}

/// Port triple of one Service port after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortSpec {
    protocol: String,
    port: u16,
    node_port: u16,
}

fn port_protocol(port: &ServicePort) -> String {
    port.protocol
        .clone()
        .unwrap_or_else(|| "TCP".to_string())
        .to_uppercase()
}

fn validate_service(service: &Service) -> Result<()> {
    let spec = service.spec.as_ref().ok_or_else(|| {
        Error::validation(format!("service {} has no spec", service.name_any()))
    })?;

    for port in spec.ports.iter().flatten() {
        if port_protocol(port) == "UDP" {
            return Err(Error::unsupported(
                "OCI load balancers do not support UDP",
            ));
        }
    }

    if let Some(affinity) = spec.session_affinity.as_deref() {
        if affinity != "None" {
            return Err(Error::unsupported(format!(
                "OCI only supports SessionAffinity \"None\", got {affinity:?}"
            )));
        }
    }

    if spec.load_balancer_ip.as_deref().is_some_and(|ip| !ip.is_empty()) {
        return Err(Error::unsupported(
            "OCI does not support setting LoadBalancerIP",
        ));
    }

    if service.annotations().contains_key(ANNOTATION_LB_INTERNAL) {
        return Err(Error::unsupported("internal load balancers are not supported"));
    }

    Ok(())
}

fn service_ports(service: &Service) -> Result<Vec<PortSpec>> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    ports
        .iter()
        .map(|p| {
            let port = u16::try_from(p.port)
                .map_err(|_| Error::validation(format!("invalid service port {}", p.port)))?;
            let node_port = p
                .node_port
                .ok_or_else(|| {
                    Error::invariant(format!("service port {port} has no node port assigned"))
                })
                .and_then(|np| {
                    u16::try_from(np)
                        .map_err(|_| Error::validation(format!("invalid node port {np}")))
                })?;
            Ok(PortSpec {
                protocol: port_protocol(p),
                port,
                node_port,
            })
        })
        .collect()
}

/// CIDRs allowed to reach the listeners. Defaults to everything.
pub fn get_load_balancer_source_ranges(service: &Service) -> Result<Vec<String>> {
    let from_spec: Vec<String> = service
        .spec
        .as_ref()
        .and_then(|s| s.load_balancer_source_ranges.clone())
        .unwrap_or_default();

    let raw: Vec<String> = if !from_spec.is_empty() {
        from_spec
    } else if let Some(value) = service.annotations().get(ANNOTATION_LB_SOURCE_RANGES) {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    if raw.is_empty() {
        return Ok(vec![ALLOW_ALL_CIDR.to_string()]);
    }

    raw.iter()
        .map(|cidr| {
            cidr.trim()
                .parse::<IpNet>()
                .map(|net| net.trunc().to_string())
                .map_err(|_| Error::validation(format!("invalid source range {cidr:?}")))
        })
        .collect()
}

fn health_checker(service: &Service, ssl_ports: &BTreeSet<u16>, port: u16) -> HealthChecker {
    let protocol = if ssl_ports.contains(&port) {
        HEALTH_CHECK_PROTOCOL_TCP
    } else {
        HEALTH_CHECK_PROTOCOL_HTTP
    };
    let url_path = (protocol == HEALTH_CHECK_PROTOCOL_HTTP).then(|| HEALTH_CHECK_PATH.to_string());

    let local_port = service.spec.as_ref().and_then(|s| {
        if s.external_traffic_policy.as_deref() == Some("Local") {
            s.health_check_node_port.and_then(|p| u16::try_from(p).ok())
        } else {
            None
        }
    });

    HealthChecker {
        protocol: protocol.to_string(),
        url_path,
        port: local_port.unwrap_or(HEALTH_CHECK_PORT),
    }
}

fn ssl_configuration(
    ssl_ports: &BTreeSet<u16>,
    certificate_name: Option<&str>,
    port: u16,
) -> Option<SslConfiguration> {
    let name = certificate_name?;
    ssl_ports.contains(&port).then(|| SslConfiguration {
        certificate_name: name.to_string(),
        verify_depth: 0,
        verify_peer_certificate: false,
    })
}

fn build_backend_sets(
    service: &Service,
    ports: &[PortSpec],
    backend_ips: &[String],
    ssl_ports: &BTreeSet<u16>,
) -> BTreeMap<String, BackendSet> {
    let mut ips: Vec<&String> = backend_ips.iter().collect();
    ips.sort();
    ips.dedup();

    ports
        .iter()
        .map(|p| {
            let name = get_backend_set_name(&p.protocol, p.port);
            let backend_set = BackendSet {
                name: name.clone(),
                policy: DEFAULT_LOAD_BALANCER_POLICY.to_string(),
                backends: ips
                    .iter()
                    .map(|ip| Backend {
                        ip_address: (*ip).clone(),
                        port: p.node_port,
                        weight: 1,
                    })
                    .collect(),
                health_checker: health_checker(service, ssl_ports, p.port),
            };
            (name, backend_set)
        })
        .collect()
}

fn build_listeners(
    service: &Service,
    ports: &[PortSpec],
    ssl_ports: &BTreeSet<u16>,
    certificate_name: Option<&str>,
) -> Result<BTreeMap<String, Listener>> {
    let annotations = service.annotations();

    let idle_timeout = match annotations.get(ANNOTATION_LB_CONNECTION_IDLE_TIMEOUT) {
        Some(raw) if !raw.is_empty() => Some(raw.trim().parse::<i64>().map_err(|_| {
            Error::validation(format!(
                "error parsing service annotation: {ANNOTATION_LB_CONNECTION_IDLE_TIMEOUT}={raw}"
            ))
        })?),
        _ => None,
    };

    let protocol_override = match annotations.get(ANNOTATION_LB_BACKEND_PROTOCOL) {
        Some(p) if p.is_empty() => Some(DEFAULT_BACKEND_PROTOCOL.to_string()),
        Some(p) if p.eq_ignore_ascii_case("HTTP") || p.eq_ignore_ascii_case("TCP") => {
            Some(p.to_uppercase())
        }
        Some(p) => {
            return Err(Error::validation(format!(
                "invalid backend protocol {p:?} requested for load balancer listener, only HTTP and TCP are supported"
            )))
        }
        None => None,
    };

    let mut listeners = BTreeMap::new();
    for p in ports {
        let protocol = protocol_override
            .clone()
            .unwrap_or_else(|| p.protocol.clone());
        let ssl = ssl_configuration(ssl_ports, certificate_name, p.port);
        let name = get_listener_name(&protocol, p.port, ssl.as_ref());
        let listener = Listener {
            name: name.clone(),
            default_backend_set_name: get_backend_set_name(&p.protocol, p.port),
            port: p.port,
            protocol,
            ssl_configuration: ssl,
            connection_configuration: idle_timeout
                .filter(|t| *t > 0)
                .map(|idle_timeout| ConnectionConfiguration { idle_timeout }),
        };
        listeners.insert(name, listener);
    }
    Ok(listeners)
}
