//! Small translations between platform and cloud identifiers.

use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Node, NodeAddress};

use crate::error::{Error, Result};
use crate::oci::types::Vnic;

pub const PROVIDER_NAME: &str = "oci";
const PROVIDER_PREFIX: &str = "oci://";

pub const NODE_INTERNAL_IP: &str = "InternalIP";
pub const NODE_EXTERNAL_IP: &str = "ExternalIP";

/// Instance OCID from a node's `spec.providerID`. Values without the scheme
/// are returned unchanged.
pub fn map_provider_id_to_instance_id(provider_id: &str) -> &str {
    provider_id
        .strip_prefix(PROVIDER_PREFIX)
        .unwrap_or(provider_id)
}

/// Zone label for an availability domain, e.g. `NWuj:PHX-AD-1` becomes `PHX-AD-1`.
pub fn map_availability_domain_to_failure_domain(ad: &str) -> &str {
    match ad.split_once(':') {
        Some((_, domain)) => domain,
        None => ad,
    }
}

/// First internal address of the node, falling back to the first external one.
pub fn node_internal_ip(node: &Node) -> Result<String> {
    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    [NODE_INTERNAL_IP, NODE_EXTERNAL_IP]
        .iter()
        .find_map(|kind| addresses.iter().find(|a| a.type_ == *kind))
        .map(|a| a.address.clone())
        .ok_or_else(|| {
            Error::not_found(format!(
                "no usable address on node {}",
                node.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}

/// Node addresses advertised by a VNIC, private first.
pub fn extract_node_addresses_from_vnic(vnic: &Vnic) -> Result<Vec<NodeAddress>> {
    let mut addresses = Vec::with_capacity(2);
    for (ip, kind) in [
        (&vnic.private_ip, NODE_INTERNAL_IP),
        (&vnic.public_ip, NODE_EXTERNAL_IP),
    ] {
        let Some(ip) = ip.as_deref().filter(|ip| !ip.is_empty()) else {
            continue;
        };
        ip.parse::<IpAddr>().map_err(|_| {
            Error::validation(format!("VNIC {} has invalid address {:?}", vnic.id, ip))
        })?;
        addresses.push(NodeAddress {
            type_: kind.to_string(),
            address: ip.to_string(),
        });
    }
    Ok(addresses)
}
