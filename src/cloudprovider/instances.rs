//! Node metadata lookups backed by the compute API

use std::sync::Arc;

use k8s_openapi::api::core::v1::NodeAddress;
use tracing::debug;

use crate::error::Result;
use crate::oci::types::Instance;
use crate::oci::{is_instance_in_terminal_state, CloudClient};
use crate::util::{
    extract_node_addresses_from_vnic, map_availability_domain_to_failure_domain,
    map_provider_id_to_instance_id,
};

/// Topology of a node as reported to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub failure_domain: String,
    pub region: String,
}

impl Zone {
    fn of(instance: &Instance) -> Self {
        Self {
            failure_domain: map_availability_domain_to_failure_domain(
                &instance.availability_domain,
            )
            .to_string(),
            region: instance.region.clone(),
        }
    }
}

pub struct Instances {
    client: Arc<dyn CloudClient>,
    compartment_id: String,
}

impl Instances {
    pub fn new(client: Arc<dyn CloudClient>, compartment_id: impl Into<String>) -> Self {
        Self {
            client,
            compartment_id: compartment_id.into(),
        }
    }

    async fn primary_addresses(&self, instance_id: &str) -> Result<Vec<NodeAddress>> {
        let vnic = self
            .client
            .get_primary_vnic_for_instance(&self.compartment_id, instance_id)
            .await?;
        extract_node_addresses_from_vnic(&vnic)
    }

    /// Addresses of the node named `node_name`.
    pub async fn node_addresses(&self, node_name: &str) -> Result<Vec<NodeAddress>> {
        debug!("NodeAddresses({:?}) called", node_name);
        let instance = self
            .client
            .get_instance_by_node_name(&self.compartment_id, node_name)
            .await?;
        self.primary_addresses(&instance.id).await
    }

    pub async fn node_addresses_by_provider_id(
        &self,
        provider_id: &str,
    ) -> Result<Vec<NodeAddress>> {
        debug!("NodeAddressesByProviderID({:?}) called", provider_id);
        self.primary_addresses(map_provider_id_to_instance_id(provider_id))
            .await
    }

    /// Instance OCID of the node named `node_name`.
    pub async fn instance_id(&self, node_name: &str) -> Result<String> {
        let instance = self
            .client
            .get_instance_by_node_name(&self.compartment_id, node_name)
            .await?;
        Ok(instance.id)
    }

    pub async fn instance_type(&self, node_name: &str) -> Result<String> {
        let instance = self
            .client
            .get_instance_by_node_name(&self.compartment_id, node_name)
            .await?;
        Ok(instance.shape)
    }

    pub async fn instance_type_by_provider_id(&self, provider_id: &str) -> Result<String> {
        let instance = self
            .client
            .get_instance(map_provider_id_to_instance_id(provider_id))
            .await?;
        Ok(instance.shape)
    }

    /// False for unknown and terminated instances.
    pub async fn instance_exists_by_provider_id(&self, provider_id: &str) -> Result<bool> {
        let id = map_provider_id_to_instance_id(provider_id);
        match self.client.get_instance(id).await {
            Ok(instance) => Ok(!is_instance_in_terminal_state(&instance)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_zone(&self, node_name: &str) -> Result<Zone> {
        let instance = self
            .client
            .get_instance_by_node_name(&self.compartment_id, node_name)
            .await?;
        Ok(Zone::of(&instance))
    }

    pub async fn get_zone_by_provider_id(&self, provider_id: &str) -> Result<Zone> {
        let instance = self
            .client
            .get_instance(map_provider_id_to_instance_id(provider_id))
            .await?;
        Ok(Zone::of(&instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::types::{Vnic, INSTANCE_TERMINATED};
    use crate::oci::FakeCloud;

    fn cloud() -> Arc<FakeCloud> {
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_instance(
            Instance {
                id: "ocid1.instance.oc1.phx.a".to_string(),
                display_name: "node-a".to_string(),
                availability_domain: "NWuj:PHX-AD-1".to_string(),
                shape: "VM.Standard2.1".to_string(),
                region: "phx".to_string(),
                lifecycle_state: "RUNNING".to_string(),
                ..Default::default()
            },
            Vnic {
                id: "vnic-a".to_string(),
                subnet_id: "subnet-a".to_string(),
                private_ip: Some("10.0.0.1".to_string()),
                public_ip: Some("129.146.0.1".to_string()),
                hostname_label: Some("node-a".to_string()),
                is_primary: Some(true),
            },
        );
        cloud
    }

    #[tokio::test]
    async fn test_node_addresses_by_name_and_provider_id() {
        let instances = Instances::new(cloud(), "compartment");
        let by_name = instances.node_addresses("node-a").await.unwrap();
        let by_id = instances
            .node_addresses_by_provider_id("oci://ocid1.instance.oc1.phx.a")
            .await
            .unwrap();
        assert_eq!(by_name, by_id);
        assert_eq!(by_name[0].address, "10.0.0.1");
        assert_eq!(by_name[0].type_, "InternalIP");
        assert_eq!(by_name[1].type_, "ExternalIP");
    }

    #[tokio::test]
    async fn test_zone_projects_availability_domain() {
        let instances = Instances::new(cloud(), "compartment");
        let zone = instances
            .get_zone_by_provider_id("ocid1.instance.oc1.phx.a")
            .await
            .unwrap();
        assert_eq!(
            zone,
            Zone {
                failure_domain: "PHX-AD-1".to_string(),
                region: "phx".to_string()
            }
        );
        assert_eq!(instances.get_zone("10.0.0.1").await.unwrap(), zone);
    }

    #[tokio::test]
    async fn test_instance_exists() {
        let cloud = cloud();
        let instances = Instances::new(cloud.clone(), "compartment");
        assert!(instances
            .instance_exists_by_provider_id("oci://ocid1.instance.oc1.phx.a")
            .await
            .unwrap());
        assert!(!instances
            .instance_exists_by_provider_id("oci://missing")
            .await
            .unwrap());

        if let Some(instance) = cloud.state().instances.get_mut("ocid1.instance.oc1.phx.a") {
            instance.lifecycle_state = INSTANCE_TERMINATED.to_string();
        }
        assert!(!instances
            .instance_exists_by_provider_id("ocid1.instance.oc1.phx.a")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_instance_type() {
        let instances = Instances::new(cloud(), "compartment");
        assert_eq!(instances.instance_type("node-a").await.unwrap(), "VM.Standard2.1");
        assert_eq!(
            instances.instance_id("node-a").await.unwrap(),
            "ocid1.instance.oc1.phx.a"
        );
    }
}
