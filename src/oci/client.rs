//! Capability traits of the cloud client facade
//!
//! Every mutating load balancer call returns a work-request id; callers block
//! on [`LoadBalancerClient::await_work_request`] before issuing the next one.
//! Storage resources have no work requests and are polled by lifecycle state
//! instead. The composed helpers (default methods) are shared by the HTTP
//! client and the in-memory fake.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::poll::{poll_until, PollPolicy};
use super::types::*;
use crate::error::{Error, Result};

/// True if the instance is being or has been torn down.
pub fn is_instance_in_terminal_state(instance: &Instance) -> bool {
    instance.lifecycle_state == INSTANCE_TERMINATING
        || instance.lifecycle_state == INSTANCE_TERMINATED
}

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// Returns the work-request id.
    async fn create_load_balancer(&self, details: &CreateLoadBalancerDetails) -> Result<String>;
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer>;
    /// `NotFound` when no load balancer carries the display name.
    async fn get_load_balancer_by_name(
        &self,
        compartment_id: &str,
        display_name: &str,
    ) -> Result<LoadBalancer>;
    async fn delete_load_balancer(&self, id: &str) -> Result<String>;

    async fn create_backend_set(&self, lb_id: &str, backend_set: &BackendSet) -> Result<String>;
    async fn update_backend_set(&self, lb_id: &str, backend_set: &BackendSet) -> Result<String>;
    async fn delete_backend_set(&self, lb_id: &str, name: &str) -> Result<String>;

    async fn create_listener(&self, lb_id: &str, listener: &Listener) -> Result<String>;
    async fn update_listener(&self, lb_id: &str, listener: &Listener) -> Result<String>;
    async fn delete_listener(&self, lb_id: &str, name: &str) -> Result<String>;

    async fn get_certificate_by_name(&self, lb_id: &str, name: &str) -> Result<Certificate>;
    async fn create_certificate(&self, lb_id: &str, details: &CertificateDetails)
        -> Result<String>;

    async fn get_work_request(&self, id: &str) -> Result<WorkRequest>;

    fn work_request_poll_policy(&self) -> PollPolicy {
        PollPolicy::work_request()
    }

    /// Block until the work request is SUCCEEDED; FAILED surfaces the cloud's message.
    async fn await_work_request(&self, id: &str) -> Result<WorkRequest> {
        let policy = self.work_request_poll_policy();
        poll_until(policy, &format!("work request {id}"), move || async move {
            let wr = self.get_work_request(id).await?;
            match wr.lifecycle_state {
                WorkRequestState::Succeeded => Ok(Some(wr)),
                WorkRequestState::Failed => Err(Error::WorkRequestFailed {
                    id: id.to_string(),
                    message: wr.failure_message(),
                }),
                state => {
                    debug!("Work request {} is {:?}", id, state);
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn create_and_await_certificate(
        &self,
        lb_id: &str,
        details: &CertificateDetails,
    ) -> Result<()> {
        let wr = self.create_certificate(lb_id, details).await?;
        self.await_work_request(&wr).await?;
        info!(
            "Certificate {} installed on load balancer {}",
            details.certificate_name, lb_id
        );
        Ok(())
    }
}

#[async_trait]
pub trait NetworkingClient: Send + Sync {
    async fn get_subnet(&self, id: &str) -> Result<Subnet>;
    /// Lookup in the process-wide subnet cache only.
    async fn get_subnet_from_cache_by_ip(&self, ip: &str) -> Result<Option<Subnet>>;
    async fn list_subnets(&self, compartment_id: &str, vcn_id: &str) -> Result<Vec<Subnet>>;

    async fn get_security_list(&self, id: &str) -> Result<SecurityList>;
    /// Replace the rule lists. `etag` turns the call into a compare-and-swap.
    async fn update_security_list(
        &self,
        id: &str,
        etag: Option<&str>,
        details: &UpdateSecurityListDetails,
    ) -> Result<SecurityList>;

    async fn get_private_ip(&self, id: &str) -> Result<PrivateIp>;
    async fn list_private_ips(&self, subnet_id: &str, ip_address: &str) -> Result<Vec<PrivateIp>>;

    async fn get_route_table(&self, id: &str) -> Result<RouteTable>;
    async fn update_route_table(
        &self,
        id: &str,
        etag: Option<&str>,
        rules: &[RouteRule],
    ) -> Result<RouteTable>;

    /// The private IP object behind an address in a subnet.
    async fn get_private_ip_by_address(
        &self,
        subnet_id: &str,
        ip_address: &str,
    ) -> Result<PrivateIp> {
        self.list_private_ips(subnet_id, ip_address)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::not_found(format!("no private IP {ip_address} in subnet {subnet_id}"))
            })
    }

    /// The oldest security list attached to the subnet.
    async fn get_default_security_list(&self, subnet: &Subnet) -> Result<SecurityList> {
        let mut lists = Vec::with_capacity(subnet.security_list_ids.len());
        for id in &subnet.security_list_ids {
            lists.push(self.get_security_list(id).await?);
        }
        lists.sort_by(|a, b| a.time_created.cmp(&b.time_created));
        lists.into_iter().next().ok_or_else(|| {
            Error::not_found(format!("no security lists attached to subnet {}", subnet.id))
        })
    }
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn get_instance(&self, id: &str) -> Result<Instance>;
    async fn list_instances(&self, compartment_id: &str) -> Result<Vec<Instance>>;
    async fn list_vnic_attachments(
        &self,
        compartment_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<VnicAttachment>>;
    async fn get_instance_vnic(&self, vnic_id: &str) -> Result<Vnic>;

    async fn get_primary_vnic_for_instance(
        &self,
        compartment_id: &str,
        instance_id: &str,
    ) -> Result<Vnic> {
        let attachments = self
            .list_vnic_attachments(compartment_id, Some(instance_id))
            .await?;
        for attachment in attachments {
            if attachment.lifecycle_state != VNIC_ATTACHMENT_ATTACHED {
                debug!(
                    "VNIC attachment {} for instance {} is {}",
                    attachment.id, instance_id, attachment.lifecycle_state
                );
                continue;
            }
            let Some(vnic_id) = attachment.vnic_id.as_deref() else {
                continue;
            };
            let vnic = self.get_instance_vnic(vnic_id).await?;
            if vnic.is_primary.unwrap_or(false) {
                return Ok(vnic);
            }
        }
        Err(Error::not_found(format!(
            "no primary VNIC for instance {instance_id}"
        )))
    }

    /// Match a node name against VNIC addresses, hostname labels and finally
    /// instance display names, ignoring terminated instances.
    async fn get_instance_by_node_name(
        &self,
        compartment_id: &str,
        node_name: &str,
    ) -> Result<Instance> {
        let attachments = self.list_vnic_attachments(compartment_id, None).await?;
        for attachment in attachments {
            if attachment.lifecycle_state != VNIC_ATTACHMENT_ATTACHED {
                continue;
            }
            let Some(vnic_id) = attachment.vnic_id.as_deref() else {
                continue;
            };
            let vnic = self.get_instance_vnic(vnic_id).await?;
            let matches = [&vnic.public_ip, &vnic.private_ip, &vnic.hostname_label]
                .into_iter()
                .flatten()
                .any(|v| v == node_name);
            if !matches {
                continue;
            }
            let instance = self.get_instance(&attachment.instance_id).await?;
            if is_instance_in_terminal_state(&instance) {
                warn!(
                    "Instance {} is in terminal state {}",
                    instance.id, instance.lifecycle_state
                );
                continue;
            }
            return Ok(instance);
        }

        let mut by_name: Vec<Instance> = self
            .list_instances(compartment_id)
            .await?
            .into_iter()
            .filter(|i| i.display_name == node_name && !is_instance_in_terminal_state(i))
            .collect();
        match by_name.len() {
            0 => Err(Error::not_found(format!("instance for node {node_name}"))),
            1 => Ok(by_name.remove(0)),
            n => Err(Error::validation(format!(
                "expected one instance named {node_name}, found {n}"
            ))),
        }
    }
}

#[async_trait]
pub trait BlockStorageClient: Send + Sync {
    async fn create_volume(&self, details: &CreateVolumeDetails) -> Result<Volume>;
    async fn get_volume(&self, id: &str) -> Result<Volume>;
    async fn delete_volume(&self, id: &str) -> Result<()>;
    async fn get_volumes_by_name(&self, name: &str, compartment_id: &str) -> Result<Vec<Volume>>;

    /// Poll until AVAILABLE. FAULTY or terminal states fail immediately.
    async fn await_volume_available(&self, id: &str, policy: PollPolicy) -> Result<Volume> {
        poll_until(policy, &format!("volume {id}"), move || async move {
            let vol = self.get_volume(id).await?;
            match vol.lifecycle_state.as_str() {
                VOLUME_AVAILABLE => Ok(Some(vol)),
                VOLUME_FAULTY | INSTANCE_TERMINATING | INSTANCE_TERMINATED => {
                    Err(Error::invariant(format!(
                        "volume {} did not become available (lifecycleState={})",
                        id, vol.lifecycle_state
                    )))
                }
                _ => Ok(None),
            }
        })
        .await
    }
}

#[async_trait]
pub trait FileStorageClient: Send + Sync {
    async fn create_file_system(&self, details: &CreateFileSystemDetails) -> Result<FileSystem>;
    async fn get_file_system(&self, id: &str) -> Result<FileSystem>;
    /// `NotFound` if no file system carries the name.
    async fn get_file_system_summary_by_display_name(
        &self,
        compartment_id: &str,
        availability_domain: &str,
        display_name: &str,
    ) -> Result<FileSystem>;
    async fn delete_file_system(&self, id: &str) -> Result<()>;

    async fn create_export(&self, details: &CreateExportDetails) -> Result<Export>;
    async fn get_export(&self, id: &str) -> Result<Export>;
    /// `NotFound` if the file system is not exported through the export set.
    async fn find_export(&self, file_system_id: &str, export_set_id: &str) -> Result<Export>;
    async fn delete_export(&self, id: &str) -> Result<()>;

    async fn get_mount_target(&self, id: &str) -> Result<MountTarget>;

    async fn await_file_system_active(&self, id: &str, policy: PollPolicy) -> Result<FileSystem> {
        poll_until(policy, &format!("file system {id}"), move || async move {
            let fs = self.get_file_system(id).await?;
            Ok((fs.lifecycle_state == FSS_ACTIVE).then_some(fs))
        })
        .await
    }

    async fn await_export_active(&self, id: &str, policy: PollPolicy) -> Result<Export> {
        poll_until(policy, &format!("export {id}"), move || async move {
            let export = self.get_export(id).await?;
            Ok((export.lifecycle_state == FSS_ACTIVE).then_some(export))
        })
        .await
    }

    async fn await_mount_target_active(
        &self,
        id: &str,
        policy: PollPolicy,
    ) -> Result<MountTarget> {
        poll_until(policy, &format!("mount target {id}"), move || async move {
            let mt = self.get_mount_target(id).await?;
            match mt.lifecycle_state.as_str() {
                FSS_ACTIVE => Ok(Some(mt)),
                "FAILED" | "DELETING" | "DELETED" => Err(Error::invariant(format!(
                    "mount target {} is {}",
                    id, mt.lifecycle_state
                ))),
                _ => Ok(None),
            }
        })
        .await
    }
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn list_availability_domains(
        &self,
        compartment_id: &str,
    ) -> Result<Vec<AvailabilityDomain>>;
}

/// Everything the reconcilers need from OCI.
pub trait CloudClient:
    LoadBalancerClient
    + NetworkingClient
    + ComputeClient
    + BlockStorageClient
    + FileStorageClient
    + IdentityClient
{
}

impl<T> CloudClient for T where
    T: LoadBalancerClient
        + NetworkingClient
        + ComputeClient
        + BlockStorageClient
        + FileStorageClient
        + IdentityClient
{
}
