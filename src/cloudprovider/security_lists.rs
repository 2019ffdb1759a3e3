//! Security-list reconciliation for load balancer and worker subnets
//!
//! Security lists are shared between every Service whose load balancer or
//! backends live in the same subnets. Each call only touches rules whose TCP
//! destination port range starts or ends at the port being managed; every
//! other rule is written back unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::load_balancer_spec::HEALTH_CHECK_PORT;
use crate::config::{LoadBalancerConfig, SecurityListManagementMode};
use crate::error::Result;
use crate::oci::types::{
    EgressSecurityRule, IngressSecurityRule, PortOptions, PortRange, SecurityList, Subnet,
    UpdateSecurityListDetails, PROTOCOL_TCP,
};
use crate::oci::CloudClient;

/// Ports whose rules one call reconciles. `None` leaves that port alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RulePorts {
    /// Load balancer listener, opened to the source CIDRs.
    pub listener: Option<u16>,
    /// Node port the backends listen on.
    pub backend: Option<u16>,
    /// Node port the load balancer health checks.
    pub health_check: Option<u16>,
}

impl RulePorts {
    /// Ports reachable on the backend subnets from the load balancer.
    fn node_ports(&self) -> impl Iterator<Item = u16> {
        self.backend.into_iter().chain(self.health_check)
    }
}

#[async_trait]
pub trait SecurityListManager: Send + Sync {
    /// Open the listener port from `source_cidrs` on the load balancer
    /// subnets, and the backend and health-check ports between load balancer
    /// and backend subnets.
    async fn update(
        &self,
        lb_subnets: &[Subnet],
        backend_subnets: &[Subnet],
        source_cidrs: &[String],
        ports: RulePorts,
    ) -> Result<()>;

    /// Remove the rules [`SecurityListManager::update`] would have added.
    ///
    /// Rules on the shared default health-check port are kept.
    async fn delete(
        &self,
        lb_subnets: &[Subnet],
        backend_subnets: &[Subnet],
        ports: RulePorts,
    ) -> Result<()>;
}

/// Select the manager for the configured mode.
pub fn new_security_list_manager(
    client: Arc<dyn CloudClient>,
    config: &LoadBalancerConfig,
) -> Arc<dyn SecurityListManager> {
    let mode = config.mode();
    let base = BaseSecurityListManager {
        client,
        security_lists: config.security_lists.clone(),
    };
    match mode {
        SecurityListManagementMode::All => {
            info!("Security list management mode: {}. Managing all security lists.", mode);
            Arc::new(DefaultSecurityListManager { base })
        }
        SecurityListManagementMode::Frontend => {
            info!(
                "Security list management mode: {}. Managing frontend security lists only.",
                mode
            );
            Arc::new(FrontendSecurityListManager { base })
        }
        SecurityListManagementMode::None => {
            info!("Security list management mode: {}. Not managing security lists.", mode);
            Arc::new(NoopSecurityListManager)
        }
    }
}

// ── rule merging ──────────────────────────────────────────────────────────

/// True if the rule's TCP destination range starts or ends at `port`.
pub fn rule_applies_to_port(tcp_options: Option<&PortOptions>, port: u16) -> bool {
    tcp_options
        .and_then(|o| o.destination_port_range.as_ref())
        .is_some_and(|r| r.min == port || r.max == port)
}

fn tcp_options(port: u16) -> Option<PortOptions> {
    Some(PortOptions {
        destination_port_range: Some(PortRange::single(port)),
        source_port_range: None,
    })
}

pub fn make_ingress_security_rule(cidr: &str, port: u16) -> IngressSecurityRule {
    IngressSecurityRule {
        source: cidr.to_string(),
        protocol: PROTOCOL_TCP.to_string(),
        tcp_options: tcp_options(port),
        udp_options: None,
        is_stateless: false,
    }
}

pub fn make_egress_security_rule(cidr: &str, port: u16) -> EgressSecurityRule {
    EgressSecurityRule {
        destination: cidr.to_string(),
        protocol: PROTOCOL_TCP.to_string(),
        tcp_options: tcp_options(port),
        udp_options: None,
        is_stateless: false,
    }
}

/// Keep foreign rules, keep wanted rules on `port`, drop stale ones unless
/// `prune` is off, then append one rule per CIDR that is still missing.
fn merge_rules<R: Clone>(
    rules: &[R],
    desired: impl IntoIterator<Item = String>,
    port: u16,
    prune: bool,
    tcp: impl Fn(&R) -> Option<&PortOptions>,
    cidr: impl Fn(&R) -> &str,
    make: impl Fn(&str, u16) -> R,
) -> Vec<R> {
    let mut missing: BTreeSet<String> = desired.into_iter().collect();
    let mut merged = Vec::with_capacity(rules.len() + missing.len());

    for rule in rules {
        if !rule_applies_to_port(tcp(rule), port) {
            merged.push(rule.clone());
        } else if missing.remove(cidr(rule)) || !prune {
            merged.push(rule.clone());
        } else {
            debug!("Dropping stale security rule {} on port {}", cidr(rule), port);
        }
    }

    for c in &missing {
        debug!("Adding security rule {} on port {}", c, port);
        merged.push(make(c, port));
    }
    merged
}

/// Rules on the default health-check port are shared by every Service that
/// does not set a node-local health check, so they are never removed.
fn is_prunable_node_port(port: u16) -> bool {
    port != HEALTH_CHECK_PORT
}

/// Ingress on a load balancer subnet from the allowed sources to the listener.
pub fn get_load_balancer_ingress_rules(
    rules: &[IngressSecurityRule],
    source_cidrs: &[String],
    port: u16,
) -> Vec<IngressSecurityRule> {
    merge_rules(
        rules,
        source_cidrs.iter().cloned(),
        port,
        true,
        |r| r.tcp_options.as_ref(),
        |r| r.source.as_str(),
        make_ingress_security_rule,
    )
}

/// Egress from a load balancer subnet to the backend subnets.
pub fn get_load_balancer_egress_rules(
    rules: &[EgressSecurityRule],
    backend_subnets: &[Subnet],
    port: u16,
) -> Vec<EgressSecurityRule> {
    merge_rules(
        rules,
        backend_subnets.iter().map(|s| s.cidr_block.clone()),
        port,
        is_prunable_node_port(port),
        |r| r.tcp_options.as_ref(),
        |r| r.destination.as_str(),
        make_egress_security_rule,
    )
}

/// Ingress on a backend subnet from the load balancer subnets.
pub fn get_node_ingress_rules(
    rules: &[IngressSecurityRule],
    lb_subnets: &[Subnet],
    port: u16,
) -> Vec<IngressSecurityRule> {
    merge_rules(
        rules,
        lb_subnets.iter().map(|s| s.cidr_block.clone()),
        port,
        is_prunable_node_port(port),
        |r| r.tcp_options.as_ref(),
        |r| r.source.as_str(),
        make_ingress_security_rule,
    )
}

fn same_rules<R: PartialEq>(current: &[R], wanted: &[R]) -> bool {
    current.len() == wanted.len()
        && wanted.iter().all(|r| current.contains(r))
        && current.iter().all(|r| wanted.contains(r))
}

/// Order-insensitive comparison of the new rule lists with the current ones.
pub fn security_list_rules_changed(
    list: &SecurityList,
    ingress: &[IngressSecurityRule],
    egress: &[EgressSecurityRule],
) -> bool {
    !same_rules(&list.ingress_security_rules, ingress)
        || !same_rules(&list.egress_security_rules, egress)
}

// ── managers ──────────────────────────────────────────────────────────────

struct BaseSecurityListManager {
    client: Arc<dyn CloudClient>,
    /// Subnet OCID to the security list to manage on it.
    security_lists: BTreeMap<String, String>,
}

impl BaseSecurityListManager {
    async fn get_security_list(&self, subnet: &Subnet) -> Result<SecurityList> {
        if let Some(id) = self.security_lists.get(&subnet.id) {
            if subnet.security_list_ids.contains(id) {
                return self.client.get_security_list(id).await;
            }
            debug!(
                "Configured security list {} is not attached to subnet {}",
                id, subnet.id
            );
        }
        self.client.get_default_security_list(subnet).await
    }

    async fn apply(
        &self,
        list: &SecurityList,
        ingress: Vec<IngressSecurityRule>,
        egress: Vec<EgressSecurityRule>,
    ) -> Result<()> {
        if !security_list_rules_changed(list, &ingress, &egress) {
            debug!("No changes for security list {}", list.id);
            return Ok(());
        }
        info!(
            "Updating security list {} ({} ingress, {} egress rules)",
            list.id,
            ingress.len(),
            egress.len()
        );
        let details = UpdateSecurityListDetails {
            ingress_security_rules: ingress,
            egress_security_rules: egress,
        };
        self.client
            .update_security_list(&list.id, list.etag.as_deref(), &details)
            .await?;
        Ok(())
    }

    async fn update_load_balancer_rules(
        &self,
        lb_subnets: &[Subnet],
        backend_subnets: &[Subnet],
        source_cidrs: &[String],
        ports: RulePorts,
        manage_egress: bool,
    ) -> Result<()> {
        for subnet in lb_subnets {
            let list = self.get_security_list(subnet).await?;
            let ingress = match ports.listener {
                Some(port) => get_load_balancer_ingress_rules(
                    &list.ingress_security_rules,
                    source_cidrs,
                    port,
                ),
                None => list.ingress_security_rules.clone(),
            };
            let mut egress = list.egress_security_rules.clone();
            if manage_egress {
                for port in ports.node_ports() {
                    egress = get_load_balancer_egress_rules(&egress, backend_subnets, port);
                }
            }
            self.apply(&list, ingress, egress).await?;
        }
        Ok(())
    }

    async fn update_backend_rules(
        &self,
        lb_subnets: &[Subnet],
        backend_subnets: &[Subnet],
        ports: RulePorts,
    ) -> Result<()> {
        if ports.node_ports().next().is_none() {
            return Ok(());
        }
        for subnet in backend_subnets {
            let list = self.get_security_list(subnet).await?;
            let mut ingress = list.ingress_security_rules.clone();
            for port in ports.node_ports() {
                ingress = get_node_ingress_rules(&ingress, lb_subnets, port);
            }
            let egress = list.egress_security_rules.clone();
            self.apply(&list, ingress, egress).await?;
        }
        Ok(())
    }
}

/// Manages load balancer ingress and egress plus backend ingress.
pub struct DefaultSecurityListManager {
    base: BaseSecurityListManager,
}

impl DefaultSecurityListManager {
    pub fn new(client: Arc<dyn CloudClient>, security_lists: BTreeMap<String, String>) -> Self {
        Self {
            base: BaseSecurityListManager {
                client,
                security_lists,
            },
        }
    }
}

#[async_trait]
impl SecurityListManager for DefaultSecurityListManager {
    async fn update(
        &self,
        lb_subnets: &[Subnet],
        backend_subnets: &[Subnet],
        source_cidrs: &[String],
        ports: RulePorts,
    ) -> Result<()> {
        self.base
            .update_load_balancer_rules(lb_subnets, backend_subnets, source_cidrs, ports, true)
            .await?;
        self.base
            .update_backend_rules(lb_subnets, backend_subnets, ports)
            .await
    }

    async fn delete(
        &self,
        lb_subnets: &[Subnet],
        backend_subnets: &[Subnet],
        ports: RulePorts,
    ) -> Result<()> {
        self.base
            .update_load_balancer_rules(lb_subnets, &[], &[], ports, true)
            .await?;
        self.base
            .update_backend_rules(&[], backend_subnets, ports)
            .await
    }
}

/// Manages load balancer ingress only.
pub struct FrontendSecurityListManager {
    base: BaseSecurityListManager,
}

impl FrontendSecurityListManager {
    pub fn new(client: Arc<dyn CloudClient>, security_lists: BTreeMap<String, String>) -> Self {
        Self {
            base: BaseSecurityListManager {
                client,
                security_lists,
            },
        }
    }
}

#[async_trait]
impl SecurityListManager for FrontendSecurityListManager {
    async fn update(
        &self,
        lb_subnets: &[Subnet],
        _backend_subnets: &[Subnet],
        source_cidrs: &[String],
        ports: RulePorts,
    ) -> Result<()> {
        self.base
            .update_load_balancer_rules(lb_subnets, &[], source_cidrs, ports, false)
            .await
    }

    async fn delete(
        &self,
        lb_subnets: &[Subnet],
        _backend_subnets: &[Subnet],
        ports: RulePorts,
    ) -> Result<()> {
        self.base
            .update_load_balancer_rules(lb_subnets, &[], &[], ports, false)
            .await
    }
}

/// Leaves security lists untouched.
pub struct NoopSecurityListManager;

#[async_trait]
impl SecurityListManager for NoopSecurityListManager {
    async fn update(
        &self,
        _lb_subnets: &[Subnet],
        _backend_subnets: &[Subnet],
        _source_cidrs: &[String],
        _ports: RulePorts,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete(
        &self,
        _lb_subnets: &[Subnet],
        _backend_subnets: &[Subnet],
        _ports: RulePorts,
    ) -> Result<()> {
        Ok(())
    }
}
