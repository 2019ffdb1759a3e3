//! Load balancer reconciliation
//!
//! `ensure_load_balancer` converges the cloud towards the [`LbSpec`] of a
//! Service one mutation at a time. Every mutation returns a work request that
//! is awaited before the next call, so a failure leaves the cloud in a state
//! the next invocation can pick up from.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::load_balancer_spec::{parse_secret_string, LbSpec, SpecDefaults, ANNOTATION_LB_TLS_SECRET};
use super::load_balancer_util::{
    get_backend_port, get_backend_set_changes, get_listener_changes, sort_and_combine_actions,
    Action, ActionType,
};
use super::secrets::SecretReader;
use super::security_lists::{RulePorts, SecurityListManager};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::oci::types::{
    BackendSet, CertificateDetails, CreateLoadBalancerDetails, LoadBalancer, Subnet,
};
use crate::oci::CloudClient;
use crate::util::{map_provider_id_to_instance_id, node_internal_ip};

/// Convert the addresses of a load balancer into Service status.
pub fn load_balancer_to_status(lb: &LoadBalancer) -> Result<LoadBalancerStatus> {
    if lb.ip_addresses.is_empty() {
        return Err(Error::invariant(format!(
            "no ip addresses found for load balancer {:?}",
            lb.display_name
        )));
    }
    Ok(LoadBalancerStatus {
        ingress: Some(
            lb.ip_addresses
                .iter()
                .map(|ip| LoadBalancerIngress {
                    ip: Some(ip.ip_address.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
    })
}

/// Ports covered by the security rules of a listener and its backend set.
/// A backend set without backends has no backend port.
fn rule_ports(listener_port: Option<u16>, backend_set: Option<&BackendSet>) -> RulePorts {
    RulePorts {
        listener: listener_port,
        backend: backend_set.and_then(|bs| get_backend_port(&bs.backends)),
        health_check: backend_set
            .map(|bs| bs.health_checker.port)
            .filter(|port| *port != 0),
    }
}

/// A backend address and, when known, the instance behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BackendHost {
    ip: String,
    instance_id: Option<String>,
}

pub struct CloudLoadBalancerProvider {
    client: Arc<dyn CloudClient>,
    secrets: Arc<dyn SecretReader>,
    security_lists: Arc<dyn SecurityListManager>,
    compartment_id: String,
    vcn_id: String,
    defaults: SpecDefaults,
}

impl CloudLoadBalancerProvider {
    pub fn new(
        client: Arc<dyn CloudClient>,
        secrets: Arc<dyn SecretReader>,
        security_lists: Arc<dyn SecurityListManager>,
        config: &Config,
        name_prefix: &str,
    ) -> Self {
        Self {
            client,
            secrets,
            security_lists,
            compartment_id: config.compartment.clone(),
            vcn_id: config.vcn.clone(),
            defaults: SpecDefaults {
                name_prefix: name_prefix.to_string(),
                subnet1: config.load_balancer.subnet1.clone(),
                subnet2: config.load_balancer.subnet2.clone(),
            },
        }
    }

    pub fn defaults(&self) -> &SpecDefaults {
        &self.defaults
    }

    /// Status of the Service's load balancer and whether it exists.
    pub async fn get_load_balancer(
        &self,
        _cluster_name: &str,
        service: &Service,
    ) -> Result<(Option<LoadBalancerStatus>, bool)> {
        let name = self.load_balancer_name(service);
        debug!("Fetching load balancer with name {:?}", name);
        match self
            .client
            .get_load_balancer_by_name(&self.compartment_id, &name)
            .await
        {
            Ok(lb) => Ok((Some(load_balancer_to_status(&lb)?), true)),
            Err(e) if e.is_not_found() => {
                debug!("Load balancer {:?} does not exist", name);
                Ok((None, false))
            }
            Err(e) => Err(e),
        }
    }

    pub fn load_balancer_name(&self, service: &Service) -> String {
        super::load_balancer_spec::get_load_balancer_name(
            &self.defaults.name_prefix,
            &service.uid().unwrap_or_default(),
        )
    }

    /// Create or converge the Service's load balancer and return its status.
    #[instrument(skip(self, service, nodes), fields(name = %service.name_any(), namespace = service.namespace(), nodes = nodes.len()))]
    pub async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        let mut spec = LbSpec::new(service, nodes, &self.defaults)?;
        info!(
            "Ensuring load balancer {:?} for cluster {:?} with {} nodes",
            spec.name,
            cluster_name,
            nodes.len()
        );

        let lb = match self
            .client
            .get_load_balancer_by_name(&self.compartment_id, &spec.name)
            .await
        {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => self.create_load_balancer(&spec).await?,
            Err(e) => return Err(e),
        };

        // Subnets of an existing load balancer cannot change.
        if let [first, second] = lb.subnet_ids.as_slice() {
            spec.subnets = [first.clone(), second.clone()];
        }

        if spec.certificate_name().is_some() {
            self.ensure_ssl_certificate(service, &lb).await?;
        }

        let hosts = nodes
            .iter()
            .map(|node| {
                Ok(BackendHost {
                    ip: node_internal_ip(node)?,
                    instance_id: node
                        .spec
                        .as_ref()
                        .and_then(|s| s.provider_id.as_deref())
                        .map(|id| map_provider_id_to_instance_id(id).to_string()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.update_load_balancer_resources(&lb, &spec, &hosts).await?;

        let status = load_balancer_to_status(&lb)?;
        info!("Successfully ensured load balancer {:?}", lb.display_name);
        Ok(status)
    }

    /// Same as [`Self::ensure_load_balancer`]; the status is discarded.
    pub async fn update_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<()> {
        info!(
            "Attempting to update load balancer {:?}",
            self.load_balancer_name(service)
        );
        self.ensure_load_balancer(cluster_name, service, nodes)
            .await
            .map(|_| ())
    }

    /// Tear down security rules and delete the load balancer. Absent is success.
    #[instrument(skip(self, service), fields(name = %service.name_any(), namespace = service.namespace()))]
    pub async fn ensure_load_balancer_deleted(
        &self,
        _cluster_name: &str,
        service: &Service,
    ) -> Result<()> {
        let name = self.load_balancer_name(service);
        info!("Attempting to delete load balancer {:?}", name);

        let lb = match self
            .client
            .get_load_balancer_by_name(&self.compartment_id, &name)
            .await
        {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => {
                info!("Could not find load balancer {:?}. Nothing to do.", name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let lb_subnets = self.get_subnets(&lb.subnet_ids).await?;
        let hosts: Vec<BackendHost> = lb
            .backend_sets
            .values()
            .flat_map(|bs| bs.backends.iter().map(|b| b.ip_address.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|ip| BackendHost {
                ip,
                instance_id: None,
            })
            .collect();
        let backend_subnets = self.get_backend_subnets(&hosts).await?;

        for (listener_name, listener) in &lb.listeners {
            debug!(
                "Deleting security rules for listener {:?} of load balancer {}",
                listener_name, lb.id
            );
            let ports = rule_ports(
                Some(listener.port),
                lb.backend_sets.get(&listener.default_backend_set_name),
            );
            self.security_lists
                .delete(&lb_subnets, &backend_subnets, ports)
                .await?;
        }

        info!("Deleting load balancer {:?} ({})", name, lb.id);
        let wr = self.client.delete_load_balancer(&lb.id).await?;
        self.client.await_work_request(&wr).await?;
        info!("Deleted load balancer {:?} ({})", name, lb.id);
        Ok(())
    }

    async fn create_load_balancer(&self, spec: &LbSpec) -> Result<LoadBalancer> {
        info!("Creating load balancer {:?} with shape {}", spec.name, spec.shape);
        let details = CreateLoadBalancerDetails {
            compartment_id: self.compartment_id.clone(),
            display_name: spec.name.clone(),
            shape_name: spec.shape.clone(),
            subnet_ids: spec.subnets.to_vec(),
            is_private: false,
        };
        let wr_id = self.client.create_load_balancer(&details).await?;
        let wr = self.client.await_work_request(&wr_id).await?;

        let lb = if wr.load_balancer_id.is_empty() {
            self.client
                .get_load_balancer_by_name(&self.compartment_id, &spec.name)
                .await?
        } else {
            self.client.get_load_balancer(&wr.load_balancer_id).await?
        };
        info!("Created load balancer {:?} with OCID {}", lb.display_name, lb.id);
        Ok(lb)
    }

    /// Install the shared certificate if the load balancer lacks it.
    async fn ensure_ssl_certificate(&self, service: &Service, lb: &LoadBalancer) -> Result<()> {
        let name = lb.display_name.as_str();
        match self.client.get_certificate_by_name(&lb.id, name).await {
            Ok(_) => {
                debug!("Certificate {:?} already exists on load balancer {}", name, lb.id);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let secret_ref = service
            .annotations()
            .get(ANNOTATION_LB_TLS_SECRET)
            .ok_or_else(|| {
                Error::invariant(format!(
                    "no {ANNOTATION_LB_TLS_SECRET:?} annotation found on a service with SSL ports"
                ))
            })?;
        let (namespace, secret_name) = parse_secret_string(secret_ref);
        let service_namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let namespace = namespace.unwrap_or(&service_namespace);

        let tls = self.secrets.read_tls_secret(namespace, secret_name).await?;
        tls.validate()?;

        let details = CertificateDetails {
            certificate_name: name.to_string(),
            public_certificate: tls.certificate,
            private_key: tls.private_key,
            ca_certificate: tls.ca_certificate,
            passphrase: None,
        };
        self.client.create_and_await_certificate(&lb.id, &details).await
    }

    async fn update_load_balancer_resources(
        &self,
        lb: &LoadBalancer,
        spec: &LbSpec,
        hosts: &[BackendHost],
    ) -> Result<()> {
        let backend_set_actions = get_backend_set_changes(&lb.backend_sets, &spec.backend_sets);
        let listener_actions = get_listener_changes(&lb.listeners, &spec.listeners);
        if backend_set_actions.is_empty() && listener_actions.is_empty() {
            debug!("Load balancer {:?} is up to date", lb.display_name);
            return Ok(());
        }

        let lb_subnets = self.get_subnets(&spec.subnets).await?;
        let backend_subnets = self.get_backend_subnets(hosts).await?;

        for action in sort_and_combine_actions(backend_set_actions, listener_actions) {
            info!("Applying {} on load balancer {}", action, lb.id);
            let wr = match &action {
                Action::BackendSet {
                    action_type,
                    backend_set,
                } => {
                    let ports = rule_ports(None, Some(backend_set));
                    match action_type {
                        ActionType::Create | ActionType::Update => {
                            self.security_lists
                                .update(&lb_subnets, &backend_subnets, &spec.source_cidrs, ports)
                                .await?;
                            if *action_type == ActionType::Create {
                                self.client.create_backend_set(&lb.id, backend_set).await?
                            } else {
                                self.client.update_backend_set(&lb.id, backend_set).await?
                            }
                        }
                        ActionType::Delete => {
                            self.security_lists
                                .delete(&lb_subnets, &backend_subnets, ports)
                                .await?;
                            self.client
                                .delete_backend_set(&lb.id, &backend_set.name)
                                .await?
                        }
                    }
                }
                Action::Listener {
                    action_type,
                    listener,
                } => {
                    let bs_name = &listener.default_backend_set_name;
                    match action_type {
                        ActionType::Delete => {
                            // The backend set may be on its way out, so read
                            // the ports from what the cloud has.
                            let ports =
                                rule_ports(Some(listener.port), lb.backend_sets.get(bs_name));
                            self.security_lists
                                .delete(&lb_subnets, &backend_subnets, ports)
                                .await?;
                            self.client.delete_listener(&lb.id, &listener.name).await?
                        }
                        ActionType::Create | ActionType::Update => {
                            let ports =
                                rule_ports(Some(listener.port), spec.backend_sets.get(bs_name));
                            self.security_lists
                                .update(&lb_subnets, &backend_subnets, &spec.source_cidrs, ports)
                                .await?;
                            if *action_type == ActionType::Create {
                                self.client.create_listener(&lb.id, listener).await?
                            } else {
                                self.client.update_listener(&lb.id, listener).await?
                            }
                        }
                    }
                }
            };
            self.client.await_work_request(&wr).await?;
        }
        Ok(())
    }

    async fn get_subnets(&self, ids: &[String]) -> Result<Vec<Subnet>> {
        let mut subnets = Vec::with_capacity(ids.len());
        for id in ids {
            subnets.push(self.client.get_subnet(id).await?);
        }
        Ok(subnets)
    }

    /// De-duplicated subnets containing the backend addresses.
    ///
    /// Lookup order: the subnet cache, the primary VNIC of the backing
    /// instance, then a scan of the VCN's subnets.
    async fn get_backend_subnets(&self, hosts: &[BackendHost]) -> Result<Vec<Subnet>> {
        let mut seen = HashSet::new();
        let mut subnets = Vec::new();
        let mut vcn_subnets: Option<Vec<Subnet>> = None;

        for host in hosts {
            let subnet = match self.client.get_subnet_from_cache_by_ip(&host.ip).await? {
                Some(subnet) => Some(subnet),
                None => self.find_subnet_for_host(host, &mut vcn_subnets).await?,
            };
            match subnet {
                Some(subnet) => {
                    if seen.insert(subnet.id.clone()) {
                        subnets.push(subnet);
                    }
                }
                None => debug!("No subnet found for backend {}", host.ip),
            }
        }
        Ok(subnets)
    }

    async fn find_subnet_for_host(
        &self,
        host: &BackendHost,
        vcn_subnets: &mut Option<Vec<Subnet>>,
    ) -> Result<Option<Subnet>> {
        if let Some(instance_id) = &host.instance_id {
            let vnic = self
                .client
                .get_primary_vnic_for_instance(&self.compartment_id, instance_id)
                .await?;
            if vnic.private_ip.as_deref() == Some(host.ip.as_str()) {
                return self.client.get_subnet(&vnic.subnet_id).await.map(Some);
            }
        }

        let ip: IpAddr = host
            .ip
            .parse()
            .map_err(|_| Error::validation(format!("invalid backend address {:?}", host.ip)))?;
        if vcn_subnets.is_none() {
            *vcn_subnets = Some(
                self.client
                    .list_subnets(&self.compartment_id, &self.vcn_id)
                    .await?,
            );
        }
        Ok(vcn_subnets
            .iter()
            .flatten()
            .find(|s| {
                s.cidr_block
                    .parse::<IpNet>()
                    .is_ok_and(|net| net.contains(&ip))
            })
            .cloned())
    }
}
