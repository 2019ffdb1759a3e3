//! In-memory OCI used by the test suites
//!
//! Mutations apply synchronously and their work requests are immediately
//! terminal. The fake enforces the same referential rules as the real
//! service (a listener needs its backend set, a referenced backend set
//! cannot be deleted, security-list updates honour `if-match`), so ordering
//! mistakes in the reconcilers surface as errors.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;

use super::client::*;
use super::types::*;
use crate::error::{Error, Result};

pub const FAKE_LB_IP: &str = "203.0.113.10";

#[derive(Debug)]
pub struct FakeState {
    pub load_balancers: BTreeMap<String, LoadBalancer>,
    pub work_requests: BTreeMap<String, WorkRequest>,
    pub subnets: BTreeMap<String, Subnet>,
    /// Subnet ids present in the client-side cache.
    pub cached_subnets: BTreeSet<String>,
    pub security_lists: BTreeMap<String, SecurityList>,
    security_list_versions: BTreeMap<String, u64>,
    pub private_ips: BTreeMap<String, PrivateIp>,
    pub route_tables: BTreeMap<String, RouteTable>,
    pub instances: BTreeMap<String, Instance>,
    pub vnics: BTreeMap<String, Vnic>,
    pub vnic_attachments: Vec<VnicAttachment>,
    pub volumes: BTreeMap<String, Volume>,
    pub created_volumes: Vec<CreateVolumeDetails>,
    pub file_systems: BTreeMap<String, FileSystem>,
    pub exports: BTreeMap<String, Export>,
    pub mount_targets: BTreeMap<String, MountTarget>,
    pub availability_domains: Vec<AvailabilityDomain>,
    /// Ordered log of mutating calls, e.g. `CreateListener TCP-80`.
    pub calls: Vec<String>,
    /// Work requests whose call log entry starts with this prefix end FAILED.
    pub fail_work_requests: Option<String>,
    /// Lifecycle state given to newly created volumes.
    pub new_volume_state: String,
    next_id: u64,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            load_balancers: BTreeMap::new(),
            work_requests: BTreeMap::new(),
            subnets: BTreeMap::new(),
            cached_subnets: BTreeSet::new(),
            security_lists: BTreeMap::new(),
            security_list_versions: BTreeMap::new(),
            private_ips: BTreeMap::new(),
            route_tables: BTreeMap::new(),
            instances: BTreeMap::new(),
            vnics: BTreeMap::new(),
            vnic_attachments: Vec::new(),
            volumes: BTreeMap::new(),
            created_volumes: Vec::new(),
            file_systems: BTreeMap::new(),
            exports: BTreeMap::new(),
            mount_targets: BTreeMap::new(),
            availability_domains: Vec::new(),
            calls: Vec::new(),
            fail_work_requests: None,
            new_volume_state: VOLUME_AVAILABLE.to_string(),
            next_id: 0,
        }
    }
}

impl FakeState {
    fn next_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("ocid1.{}.oc1.fake.{}", kind, self.next_id)
    }

    /// Record a call and create its work request. Returns the id and whether
    /// the mutation should be applied.
    fn work_request(&mut self, call: String, lb_id: &str) -> (String, bool) {
        let failed = self
            .fail_work_requests
            .as_deref()
            .is_some_and(|prefix| call.starts_with(prefix));
        let id = self.next_id("loadbalancerworkrequest");
        let wr = WorkRequest {
            id: id.clone(),
            load_balancer_id: lb_id.to_string(),
            kind: call.split(' ').next().unwrap_or_default().to_string(),
            lifecycle_state: if failed {
                WorkRequestState::Failed
            } else {
                WorkRequestState::Succeeded
            },
            message: if failed {
                format!("{call} rejected by fake")
            } else {
                String::new()
            },
            error_details: vec![],
        };
        self.calls.push(call);
        self.work_requests.insert(id.clone(), wr);
        (id, !failed)
    }

    fn lb_mut(&mut self, id: &str) -> Result<&mut LoadBalancer> {
        self.load_balancers
            .get_mut(id)
            .ok_or_else(|| not_found("load balancer", id))
    }

    fn security_list_with_etag(&self, id: &str) -> Result<SecurityList> {
        let mut sl = self
            .security_lists
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("security list", id))?;
        let version = self.security_list_versions.get(id).copied().unwrap_or(0);
        sl.etag = Some(format!("etag-{version}"));
        Ok(sl)
    }
}

fn not_found(kind: &str, id: &str) -> Error {
    Error::CloudApi {
        status: 404,
        code: "NotAuthorizedOrNotFound".to_string(),
        message: format!("{kind} {id} not found"),
    }
}

fn conflict(message: String) -> Error {
    Error::CloudApi {
        status: 409,
        code: "Conflict".to_string(),
        message,
    }
}

#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mutating calls recorded so far.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.state().subnets.insert(subnet.id.clone(), subnet);
    }

    pub fn add_security_list(&self, list: SecurityList) {
        let mut state = self.state();
        state.security_list_versions.insert(list.id.clone(), 1);
        state.security_lists.insert(list.id.clone(), list);
    }

    /// Register an instance with a single primary VNIC.
    pub fn add_instance(&self, instance: Instance, vnic: Vnic) {
        let mut state = self.state();
        let attachment_id = state.next_id("vnicattachment");
        state.vnic_attachments.push(VnicAttachment {
            id: attachment_id,
            instance_id: instance.id.clone(),
            vnic_id: Some(vnic.id.clone()),
            lifecycle_state: VNIC_ATTACHMENT_ATTACHED.to_string(),
        });
        state.vnics.insert(vnic.id.clone(), vnic);
        state.instances.insert(instance.id.clone(), instance);
    }

    pub fn add_private_ip(&self, private_ip: PrivateIp) {
        self.state()
            .private_ips
            .insert(private_ip.id.clone(), private_ip);
    }

    pub fn add_route_table(&self, route_table: RouteTable) {
        self.state()
            .route_tables
            .insert(route_table.id.clone(), route_table);
    }

    pub fn route_table(&self, id: &str) -> Option<RouteTable> {
        self.state().route_tables.get(id).cloned()
    }

    pub fn add_mount_target(&self, mount_target: MountTarget) {
        self.state()
            .mount_targets
            .insert(mount_target.id.clone(), mount_target);
    }

    pub fn add_availability_domain(&self, name: &str) {
        self.state().availability_domains.push(AvailabilityDomain {
            name: name.to_string(),
            compartment_id: String::new(),
        });
    }

    /// Install a load balancer directly, bypassing work requests.
    pub fn insert_load_balancer(&self, lb: LoadBalancer) {
        self.state().load_balancers.insert(lb.id.clone(), lb);
    }

    pub fn load_balancer_by_name(&self, name: &str) -> Option<LoadBalancer> {
        self.state()
            .load_balancers
            .values()
            .find(|lb| lb.display_name == name)
            .cloned()
    }

    pub fn security_list(&self, id: &str) -> Option<SecurityList> {
        self.state().security_lists.get(id).cloned()
    }
}

#[async_trait]
impl LoadBalancerClient for FakeCloud {
    async fn create_load_balancer(&self, details: &CreateLoadBalancerDetails) -> Result<String> {
        let mut state = self.state();
        let id = state.next_id("loadbalancer");
        let (wr, apply) = state.work_request(
            format!("CreateLoadBalancer {}", details.display_name),
            &id,
        );
        if apply {
            state.load_balancers.insert(
                id.clone(),
                LoadBalancer {
                    id: id.clone(),
                    display_name: details.display_name.clone(),
                    compartment_id: details.compartment_id.clone(),
                    shape_name: details.shape_name.clone(),
                    subnet_ids: details.subnet_ids.clone(),
                    ip_addresses: vec![IpAddress {
                        ip_address: FAKE_LB_IP.to_string(),
                        is_public: Some(!details.is_private),
                    }],
                    is_private: details.is_private,
                    lifecycle_state: "ACTIVE".to_string(),
                    ..Default::default()
                },
            );
        }
        Ok(wr)
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        self.state()
            .load_balancers
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("load balancer", id))
    }

    async fn get_load_balancer_by_name(
        &self,
        _compartment_id: &str,
        display_name: &str,
    ) -> Result<LoadBalancer> {
        self.load_balancer_by_name(display_name)
            .ok_or_else(|| Error::not_found(format!("load balancer named {display_name}")))
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<String> {
        let mut state = self.state();
        let display_name = state.lb_mut(id)?.display_name.clone();
        let (wr, apply) = state.work_request(format!("DeleteLoadBalancer {display_name}"), id);
        if apply {
            state.load_balancers.remove(id);
        }
        Ok(wr)
    }

    async fn create_backend_set(&self, lb_id: &str, backend_set: &BackendSet) -> Result<String> {
        let mut state = self.state();
        if state.lb_mut(lb_id)?.backend_sets.contains_key(&backend_set.name) {
            return Err(conflict(format!("backend set {} exists", backend_set.name)));
        }
        let (wr, apply) = state.work_request(format!("CreateBackendSet {}", backend_set.name), lb_id);
        if apply {
            state
                .lb_mut(lb_id)?
                .backend_sets
                .insert(backend_set.name.clone(), backend_set.clone());
        }
        Ok(wr)
    }

    async fn update_backend_set(&self, lb_id: &str, backend_set: &BackendSet) -> Result<String> {
        let mut state = self.state();
        if !state.lb_mut(lb_id)?.backend_sets.contains_key(&backend_set.name) {
            return Err(not_found("backend set", &backend_set.name));
        }
        let (wr, apply) = state.work_request(format!("UpdateBackendSet {}", backend_set.name), lb_id);
        if apply {
            state
                .lb_mut(lb_id)?
                .backend_sets
                .insert(backend_set.name.clone(), backend_set.clone());
        }
        Ok(wr)
    }

    async fn delete_backend_set(&self, lb_id: &str, name: &str) -> Result<String> {
        let mut state = self.state();
        let lb = state.lb_mut(lb_id)?;
        if !lb.backend_sets.contains_key(name) {
            return Err(not_found("backend set", name));
        }
        if let Some(listener) = lb
            .listeners
            .values()
            .find(|l| l.default_backend_set_name == name)
        {
            return Err(conflict(format!(
                "backend set {} is used by listener {}",
                name, listener.name
            )));
        }
        let (wr, apply) = state.work_request(format!("DeleteBackendSet {name}"), lb_id);
        if apply {
            state.lb_mut(lb_id)?.backend_sets.remove(name);
        }
        Ok(wr)
    }

    async fn create_listener(&self, lb_id: &str, listener: &Listener) -> Result<String> {
        let mut state = self.state();
        let lb = state.lb_mut(lb_id)?;
        if !lb.backend_sets.contains_key(&listener.default_backend_set_name) {
            return Err(not_found("backend set", &listener.default_backend_set_name));
        }
        if let Some(ssl) = &listener.ssl_configuration {
            if !lb.certificates.contains_key(&ssl.certificate_name) {
                return Err(not_found("certificate", &ssl.certificate_name));
            }
        }
        if lb.listeners.contains_key(&listener.name) {
            return Err(conflict(format!("listener {} exists", listener.name)));
        }
        let (wr, apply) = state.work_request(format!("CreateListener {}", listener.name), lb_id);
        if apply {
            state
                .lb_mut(lb_id)?
                .listeners
                .insert(listener.name.clone(), listener.clone());
        }
        Ok(wr)
    }

    async fn update_listener(&self, lb_id: &str, listener: &Listener) -> Result<String> {
        let mut state = self.state();
        let lb = state.lb_mut(lb_id)?;
        if !lb.listeners.contains_key(&listener.name) {
            return Err(not_found("listener", &listener.name));
        }
        if !lb.backend_sets.contains_key(&listener.default_backend_set_name) {
            return Err(not_found("backend set", &listener.default_backend_set_name));
        }
        let (wr, apply) = state.work_request(format!("UpdateListener {}", listener.name), lb_id);
        if apply {
            state
                .lb_mut(lb_id)?
                .listeners
                .insert(listener.name.clone(), listener.clone());
        }
        Ok(wr)
    }

    async fn delete_listener(&self, lb_id: &str, name: &str) -> Result<String> {
        let mut state = self.state();
        if !state.lb_mut(lb_id)?.listeners.contains_key(name) {
            return Err(not_found("listener", name));
        }
        let (wr, apply) = state.work_request(format!("DeleteListener {name}"), lb_id);
        if apply {
            state.lb_mut(lb_id)?.listeners.remove(name);
        }
        Ok(wr)
    }

    async fn get_certificate_by_name(&self, lb_id: &str, name: &str) -> Result<Certificate> {
        let mut state = self.state();
        state
            .lb_mut(lb_id)?
            .certificates
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("certificate", name))
    }

    async fn create_certificate(
        &self,
        lb_id: &str,
        details: &CertificateDetails,
    ) -> Result<String> {
        let mut state = self.state();
        state.lb_mut(lb_id)?;
        let (wr, apply) = state.work_request(
            format!("CreateCertificate {}", details.certificate_name),
            lb_id,
        );
        if apply {
            state.lb_mut(lb_id)?.certificates.insert(
                details.certificate_name.clone(),
                Certificate {
                    certificate_name: details.certificate_name.clone(),
                    public_certificate: details.public_certificate.clone(),
                    ca_certificate: details.ca_certificate.clone(),
                },
            );
        }
        Ok(wr)
    }

    async fn get_work_request(&self, id: &str) -> Result<WorkRequest> {
        self.state()
            .work_requests
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("work request", id))
    }
}

#[async_trait]
impl NetworkingClient for FakeCloud {
    async fn get_subnet(&self, id: &str) -> Result<Subnet> {
        let mut state = self.state();
        let subnet = state
            .subnets
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("subnet", id))?;
        state.cached_subnets.insert(id.to_string());
        Ok(subnet)
    }

    async fn get_subnet_from_cache_by_ip(&self, ip: &str) -> Result<Option<Subnet>> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| Error::validation(format!("invalid IP address {ip:?}")))?;
        let state = self.state();
        Ok(state
            .cached_subnets
            .iter()
            .filter_map(|id| state.subnets.get(id))
            .find(|s| {
                s.cidr_block
                    .parse::<IpNet>()
                    .map(|net| net.contains(&addr))
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn list_subnets(&self, _compartment_id: &str, vcn_id: &str) -> Result<Vec<Subnet>> {
        let mut state = self.state();
        let subnets: Vec<Subnet> = state
            .subnets
            .values()
            .filter(|s| s.vcn_id == vcn_id)
            .cloned()
            .collect();
        for s in &subnets {
            state.cached_subnets.insert(s.id.clone());
        }
        Ok(subnets)
    }

    async fn get_security_list(&self, id: &str) -> Result<SecurityList> {
        self.state().security_list_with_etag(id)
    }

    async fn update_security_list(
        &self,
        id: &str,
        etag: Option<&str>,
        details: &UpdateSecurityListDetails,
    ) -> Result<SecurityList> {
        let mut state = self.state();
        let current = state.security_list_with_etag(id)?;
        if let Some(expected) = etag {
            if current.etag.as_deref() != Some(expected) {
                return Err(Error::CloudApi {
                    status: 412,
                    code: "NoEtagMatch".to_string(),
                    message: format!("etag {expected} does not match for {id}"),
                });
            }
        }
        state.calls.push(format!("UpdateSecurityList {id}"));
        if let Some(sl) = state.security_lists.get_mut(id) {
            sl.ingress_security_rules = details.ingress_security_rules.clone();
            sl.egress_security_rules = details.egress_security_rules.clone();
        }
        *state.security_list_versions.entry(id.to_string()).or_insert(0) += 1;
        state.security_list_with_etag(id)
    }

    async fn get_private_ip(&self, id: &str) -> Result<PrivateIp> {
        self.state()
            .private_ips
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("private IP", id))
    }

    async fn list_private_ips(&self, subnet_id: &str, ip_address: &str) -> Result<Vec<PrivateIp>> {
        Ok(self
            .state()
            .private_ips
            .values()
            .filter(|ip| ip.subnet_id == subnet_id && ip.ip_address == ip_address)
            .cloned()
            .collect())
    }

    async fn get_route_table(&self, id: &str) -> Result<RouteTable> {
        self.state()
            .route_tables
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("route table", id))
    }

    async fn update_route_table(
        &self,
        id: &str,
        _etag: Option<&str>,
        rules: &[RouteRule],
    ) -> Result<RouteTable> {
        let mut state = self.state();
        state.calls.push(format!("UpdateRouteTable {id}"));
        let table = state
            .route_tables
            .get_mut(id)
            .ok_or_else(|| not_found("route table", id))?;
        table.route_rules = rules.to_vec();
        Ok(table.clone())
    }
}

#[async_trait]
impl ComputeClient for FakeCloud {
    async fn get_instance(&self, id: &str) -> Result<Instance> {
        self.state()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("instance", id))
    }

    async fn list_instances(&self, _compartment_id: &str) -> Result<Vec<Instance>> {
        Ok(self.state().instances.values().cloned().collect())
    }

    async fn list_vnic_attachments(
        &self,
        _compartment_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<VnicAttachment>> {
        Ok(self
            .state()
            .vnic_attachments
            .iter()
            .filter(|a| instance_id.map_or(true, |id| a.instance_id == id))
            .cloned()
            .collect())
    }

    async fn get_instance_vnic(&self, vnic_id: &str) -> Result<Vnic> {
        self.state()
            .vnics
            .get(vnic_id)
            .cloned()
            .ok_or_else(|| not_found("vnic", vnic_id))
    }
}

#[async_trait]
impl BlockStorageClient for FakeCloud {
    async fn create_volume(&self, details: &CreateVolumeDetails) -> Result<Volume> {
        let mut state = self.state();
        let id = state.next_id("volume");
        state.calls.push(format!("CreateVolume {}", details.display_name));
        state.created_volumes.push(details.clone());
        let volume = Volume {
            id: id.clone(),
            display_name: details.display_name.clone(),
            compartment_id: details.compartment_id.clone(),
            availability_domain: details.availability_domain.clone(),
            size_in_mbs: details.size_in_mbs,
            lifecycle_state: state.new_volume_state.clone(),
        };
        state.volumes.insert(id, volume.clone());
        Ok(volume)
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        self.state()
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("volume", id))
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("DeleteVolume {id}"));
        state
            .volumes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("volume", id))
    }

    async fn get_volumes_by_name(&self, name: &str, compartment_id: &str) -> Result<Vec<Volume>> {
        Ok(self
            .state()
            .volumes
            .values()
            .filter(|v| v.display_name == name && v.compartment_id == compartment_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FileStorageClient for FakeCloud {
    async fn create_file_system(&self, details: &CreateFileSystemDetails) -> Result<FileSystem> {
        let mut state = self.state();
        let id = state.next_id("filesystem");
        state
            .calls
            .push(format!("CreateFileSystem {}", details.display_name));
        let fs = FileSystem {
            id: id.clone(),
            display_name: details.display_name.clone(),
            compartment_id: details.compartment_id.clone(),
            availability_domain: details.availability_domain.clone(),
            lifecycle_state: FSS_ACTIVE.to_string(),
        };
        state.file_systems.insert(id, fs.clone());
        Ok(fs)
    }

    async fn get_file_system(&self, id: &str) -> Result<FileSystem> {
        self.state()
            .file_systems
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("file system", id))
    }

    async fn get_file_system_summary_by_display_name(
        &self,
        compartment_id: &str,
        availability_domain: &str,
        display_name: &str,
    ) -> Result<FileSystem> {
        self.state()
            .file_systems
            .values()
            .find(|fs| {
                fs.display_name == display_name
                    && fs.compartment_id == compartment_id
                    && fs.availability_domain == availability_domain
            })
            .cloned()
            .ok_or_else(|| Error::not_found(format!("file system named {display_name}")))
    }

    async fn delete_file_system(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("DeleteFileSystem {id}"));
        if state.exports.values().any(|e| e.file_system_id == id) {
            return Err(conflict(format!("file system {id} is still exported")));
        }
        state
            .file_systems
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("file system", id))
    }

    async fn create_export(&self, details: &CreateExportDetails) -> Result<Export> {
        let mut state = self.state();
        if !state.file_systems.contains_key(&details.file_system_id) {
            return Err(not_found("file system", &details.file_system_id));
        }
        let id = state.next_id("export");
        state.calls.push(format!("CreateExport {}", details.path));
        let export = Export {
            id: id.clone(),
            export_set_id: details.export_set_id.clone(),
            file_system_id: details.file_system_id.clone(),
            path: details.path.clone(),
            lifecycle_state: FSS_ACTIVE.to_string(),
        };
        state.exports.insert(id, export.clone());
        Ok(export)
    }

    async fn get_export(&self, id: &str) -> Result<Export> {
        self.state()
            .exports
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("export", id))
    }

    async fn find_export(&self, file_system_id: &str, export_set_id: &str) -> Result<Export> {
        self.state()
            .exports
            .values()
            .find(|e| e.file_system_id == file_system_id && e.export_set_id == export_set_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("export of {file_system_id}")))
    }

    async fn delete_export(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("DeleteExport {id}"));
        state
            .exports
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("export", id))
    }

    async fn get_mount_target(&self, id: &str) -> Result<MountTarget> {
        self.state()
            .mount_targets
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("mount target", id))
    }
}

#[async_trait]
impl IdentityClient for FakeCloud {
    async fn list_availability_domains(
        &self,
        _compartment_id: &str,
    ) -> Result<Vec<AvailabilityDomain>> {
        Ok(self.state().availability_domains.clone())
    }
}

/// Timestamp helper for security lists in fixtures.
pub fn created_at(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_set(name: &str) -> BackendSet {
        BackendSet {
            name: name.to_string(),
            policy: "ROUND_ROBIN".to_string(),
            backends: vec![],
            health_checker: HealthChecker {
                protocol: "HTTP".to_string(),
                url_path: Some("/healthz".to_string()),
                port: 10256,
            },
        }
    }

    #[tokio::test]
    async fn test_backend_set_in_use_cannot_be_deleted() {
        let cloud = FakeCloud::new();
        let wr = cloud
            .create_load_balancer(&CreateLoadBalancerDetails {
                display_name: "lb".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let lb_id = cloud.await_work_request(&wr).await.unwrap().load_balancer_id;

        cloud
            .create_backend_set(&lb_id, &backend_set("TCP-80"))
            .await
            .unwrap();
        let listener = Listener {
            name: "TCP-80".to_string(),
            default_backend_set_name: "TCP-80".to_string(),
            port: 80,
            protocol: "TCP".to_string(),
            ..Default::default()
        };
        cloud.create_listener(&lb_id, &listener).await.unwrap();

        let err = cloud.delete_backend_set(&lb_id, "TCP-80").await.unwrap_err();
        assert!(err.is_conflict());

        cloud.delete_listener(&lb_id, "TCP-80").await.unwrap();
        cloud.delete_backend_set(&lb_id, "TCP-80").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_work_request_is_surfaced() {
        let cloud = FakeCloud::new();
        cloud.state().fail_work_requests = Some("CreateLoadBalancer".to_string());
        let wr = cloud
            .create_load_balancer(&CreateLoadBalancerDetails {
                display_name: "lb".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = cloud.await_work_request(&wr).await.unwrap_err();
        assert!(matches!(err, Error::WorkRequestFailed { .. }));
        assert!(cloud.load_balancer_by_name("lb").is_none());
    }

    #[tokio::test]
    async fn test_security_list_etag_mismatch() {
        let cloud = FakeCloud::new();
        cloud.add_security_list(SecurityList {
            id: "sl".to_string(),
            ..Default::default()
        });
        let current = cloud.get_security_list("sl").await.unwrap();
        let details = UpdateSecurityListDetails::default();
        cloud
            .update_security_list("sl", current.etag.as_deref(), &details)
            .await
            .unwrap();
        let stale = cloud
            .update_security_list("sl", current.etag.as_deref(), &details)
            .await
            .unwrap_err();
        assert!(stale.is_conflict());
    }
}
