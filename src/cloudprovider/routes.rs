//! Pod CIDR routes through node private IPs
//!
//! A route table can only be replaced as a whole, so concurrent route changes
//! race. Updates are last-writer-wins and the next reconcile restores any rule
//! a racing writer dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::oci::types::RouteRule;
use crate::oci::CloudClient;
use crate::util::map_provider_id_to_instance_id;

pub const DESTINATION_TYPE_CIDR: &str = "CIDR_BLOCK";

/// Route table and next hop for traffic sent to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteTarget {
    route_table_id: String,
    private_ip_id: String,
}

pub struct Routes {
    client: Arc<dyn CloudClient>,
    compartment_id: String,
    /// Subnet OCID to route table OCID. A subnet keeps its route table for life.
    route_tables: Mutex<HashMap<String, String>>,
}

impl Routes {
    pub fn new(client: Arc<dyn CloudClient>, compartment_id: impl Into<String>) -> Self {
        Self {
            client,
            compartment_id: compartment_id.into(),
            route_tables: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.route_tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn route_table_for_subnet(&self, subnet_id: &str) -> Result<String> {
        let cached = self.lock().get(subnet_id).cloned();
        if let Some(id) = cached {
            return Ok(id);
        }
        let subnet = self.client.get_subnet(subnet_id).await?;
        if subnet.route_table_id.is_empty() {
            return Err(Error::invariant(format!(
                "subnet {subnet_id} has no route table"
            )));
        }
        debug!("Subnet {} routes through {}", subnet_id, subnet.route_table_id);
        self.lock()
            .insert(subnet_id.to_string(), subnet.route_table_id.clone());
        Ok(subnet.route_table_id)
    }

    async fn route_target(&self, node: &Node) -> Result<RouteTarget> {
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .ok_or_else(|| {
                Error::validation(format!("node {} has no provider ID", node.name_any()))
            })?;
        let vnic = self
            .client
            .get_primary_vnic_for_instance(
                &self.compartment_id,
                map_provider_id_to_instance_id(provider_id),
            )
            .await?;
        let address = vnic.private_ip.as_deref().ok_or_else(|| {
            Error::invariant(format!("primary VNIC {} has no private IP", vnic.id))
        })?;
        let private_ip = self
            .client
            .get_private_ip_by_address(&vnic.subnet_id, address)
            .await?;
        Ok(RouteTarget {
            route_table_id: self.route_table_for_subnet(&vnic.subnet_id).await?,
            private_ip_id: private_ip.id,
        })
    }

    /// Send `destination_cidr` to the node's primary private IP.
    #[instrument(skip(self, node), fields(node = %node.name_any()))]
    pub async fn create_route(&self, node: &Node, destination_cidr: &str) -> Result<()> {
        let destination = parse_destination(destination_cidr)?;
        let target = self.route_target(node).await?;
        let table = self.client.get_route_table(&target.route_table_id).await?;

        let mut rules = table.route_rules;
        match rules.iter_mut().find(|r| r.destination == destination) {
            Some(rule) if rule.network_entity_id == target.private_ip_id => {
                debug!(
                    "Route {} -> {} already exists",
                    destination, target.private_ip_id
                );
                return Ok(());
            }
            Some(rule) => {
                info!(
                    "Retargeting route {} from {} to {}",
                    destination, rule.network_entity_id, target.private_ip_id
                );
                rule.network_entity_id = target.private_ip_id.clone();
            }
            None => {
                info!("Adding route {} -> {}", destination, target.private_ip_id);
                rules.push(RouteRule {
                    destination: destination.clone(),
                    destination_type: DESTINATION_TYPE_CIDR.to_string(),
                    network_entity_id: target.private_ip_id.clone(),
                });
            }
        }
        self.client
            .update_route_table(&table.id, None, &rules)
            .await?;
        Ok(())
    }

    /// Drop every rule for `destination_cidr` from the node's route table.
    #[instrument(skip(self, node), fields(node = %node.name_any()))]
    pub async fn delete_route(&self, node: &Node, destination_cidr: &str) -> Result<()> {
        let destination = parse_destination(destination_cidr)?;
        let target = self.route_target(node).await?;
        let table = self.client.get_route_table(&target.route_table_id).await?;

        let mut rules = table.route_rules;
        let before = rules.len();
        rules.retain(|r| r.destination != destination);
        if rules.len() == before {
            debug!("No route for {} in {}", destination, table.id);
            return Ok(());
        }
        info!("Deleting route {} from {}", destination, table.id);
        self.client
            .update_route_table(&table.id, None, &rules)
            .await?;
        Ok(())
    }
}

/// Canonical form of a destination CIDR.
fn parse_destination(cidr: &str) -> Result<String> {
    cidr.trim()
        .parse::<IpNet>()
        .map(|net| net.trunc().to_string())
        .map_err(|_| Error::validation(format!("invalid route destination {cidr:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::fixtures::node;
    use crate::oci::types::{Instance, PrivateIp, RouteTable, Subnet, Vnic};
    use crate::oci::FakeCloud;

    const GATEWAY: &str = "ocid1.internetgateway.oc1..igw";

    fn gateway_rule() -> RouteRule {
        RouteRule {
            destination: "0.0.0.0/0".to_string(),
            destination_type: DESTINATION_TYPE_CIDR.to_string(),
            network_entity_id: GATEWAY.to_string(),
        }
    }

    fn cloud() -> Arc<FakeCloud> {
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_subnet(Subnet {
            id: "node-subnet".to_string(),
            cidr_block: "10.0.10.0/24".to_string(),
            route_table_id: "rt1".to_string(),
            ..Default::default()
        });
        cloud.add_route_table(RouteTable {
            id: "rt1".to_string(),
            route_rules: vec![gateway_rule()],
            ..Default::default()
        });
        for (name, ip) in [("a", "10.0.10.5"), ("b", "10.0.10.6")] {
            cloud.add_instance(
                Instance {
                    id: format!("ocid1.instance.oc1.{name}"),
                    display_name: name.to_string(),
                    lifecycle_state: "RUNNING".to_string(),
                    ..Default::default()
                },
                Vnic {
                    id: format!("vnic-{name}"),
                    subnet_id: "node-subnet".to_string(),
                    private_ip: Some(ip.to_string()),
                    is_primary: Some(true),
                    ..Default::default()
                },
            );
            cloud.add_private_ip(PrivateIp {
                id: format!("ocid1.privateip.{name}"),
                ip_address: ip.to_string(),
                subnet_id: "node-subnet".to_string(),
                vnic_id: Some(format!("vnic-{name}")),
            });
        }
        cloud
    }

    fn pod_route(target: &str) -> RouteRule {
        RouteRule {
            destination: "10.244.1.0/24".to_string(),
            destination_type: DESTINATION_TYPE_CIDR.to_string(),
            network_entity_id: target.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_route_keeps_other_rules() {
        let cloud = cloud();
        let routes = Routes::new(cloud.clone(), "compartment");
        routes
            .create_route(&node("a", "10.0.10.5"), "10.244.1.0/24")
            .await
            .unwrap();

        assert_eq!(
            cloud.route_table("rt1").unwrap().route_rules,
            vec![gateway_rule(), pod_route("ocid1.privateip.a")]
        );
        assert_eq!(cloud.calls(), vec!["UpdateRouteTable rt1"]);

        cloud.clear_calls();
        routes
            .create_route(&node("a", "10.0.10.5"), "10.244.1.0/24")
            .await
            .unwrap();
        assert!(cloud.calls().is_empty(), "calls: {:?}", cloud.calls());
    }

    #[tokio::test]
    async fn test_create_route_retargets_moved_cidr() {
        let cloud = cloud();
        let routes = Routes::new(cloud.clone(), "compartment");
        routes
            .create_route(&node("a", "10.0.10.5"), "10.244.1.0/24")
            .await
            .unwrap();
        routes
            .create_route(&node("b", "10.0.10.6"), "10.244.1.0/24")
            .await
            .unwrap();

        assert_eq!(
            cloud.route_table("rt1").unwrap().route_rules,
            vec![gateway_rule(), pod_route("ocid1.privateip.b")]
        );
    }

    #[tokio::test]
    async fn test_delete_route() {
        let cloud = cloud();
        let routes = Routes::new(cloud.clone(), "compartment");
        let a = node("a", "10.0.10.5");
        routes.create_route(&a, "10.244.1.0/24").await.unwrap();
        cloud.clear_calls();

        routes.delete_route(&a, "10.244.1.0/24").await.unwrap();
        assert_eq!(
            cloud.route_table("rt1").unwrap().route_rules,
            vec![gateway_rule()]
        );
        assert_eq!(cloud.calls(), vec!["UpdateRouteTable rt1"]);

        cloud.clear_calls();
        routes.delete_route(&a, "10.244.1.0/24").await.unwrap();
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_destination_is_rejected() {
        let cloud = cloud();
        let routes = Routes::new(cloud.clone(), "compartment");
        let err = routes
            .create_route(&node("a", "10.0.10.5"), "pods")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subnet_without_route_table() {
        let cloud = cloud();
        if let Some(subnet) = cloud.state().subnets.get_mut("node-subnet") {
            subnet.route_table_id.clear();
        }
        let err = Routes::new(cloud.clone(), "compartment")
            .create_route(&node("a", "10.0.10.5"), "10.244.1.0/24")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }
}
