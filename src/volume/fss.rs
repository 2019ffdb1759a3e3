//! File storage (NFS) dialect

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{NFSVolumeSource, PersistentVolume, PersistentVolumeSpec};
use kube::api::ObjectMeta;
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument};

use super::block::OCI_VOLUME_ID;
use super::{
    storage_capacity, ProvisionOptions, ProvisionerPlugin, ACCESS_MODE_ROX, LABEL_ZONE_REGION,
};
use crate::error::{Error, Result};
use crate::oci::types::{
    AvailabilityDomain, CreateExportDetails, CreateFileSystemDetails, Export, FileSystem,
};
use crate::oci::{CloudClient, PollPolicy};

pub const OCI_EXPORT_ID: &str = "ociExportID";
pub const OCI_MOUNT_TARGET_ID: &str = "ociMountTargetID";
/// PVC annotation selecting the mount target.
pub const ANNOTATION_MOUNT_TARGET_ID: &str = "volume.beta.kubernetes.io/oci-mount-target-id";
/// Storage-class parameter selecting the mount target.
pub const MNT_TARGET_ID_PARAM: &str = "mntTargetId";

/// True when at least one access mode is requested and all of them are
/// `ReadOnlyMany`.
pub fn is_read_only(access_modes: &[String]) -> bool {
    !access_modes.is_empty() && access_modes.iter().all(|m| m == ACCESS_MODE_ROX)
}

pub struct FilesystemProvisioner {
    client: Arc<dyn CloudClient>,
    region: String,
    compartment_id: String,
    name_prefix: String,
    poll: PollPolicy,
}

impl FilesystemProvisioner {
    pub fn new(
        client: Arc<dyn CloudClient>,
        region: &str,
        compartment_id: &str,
        name_prefix: &str,
    ) -> Self {
        Self {
            client,
            region: region.to_string(),
            compartment_id: compartment_id.to_string(),
            name_prefix: name_prefix.to_string(),
            poll: PollPolicy::file_storage(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn mount_target_id<'a>(options: &'a ProvisionOptions) -> Result<&'a str> {
        let id = options
            .pvc_annotation(ANNOTATION_MOUNT_TARGET_ID)
            .or_else(|| options.parameters.get(MNT_TARGET_ID_PARAM).map(String::as_str))
            .unwrap_or_default();
        if id.is_empty() {
            return Err(Error::validation(format!(
                "no mount target specified: set the {ANNOTATION_MOUNT_TARGET_ID} annotation \
                 or the {MNT_TARGET_ID_PARAM} storage class parameter"
            )));
        }
        Ok(id)
    }

    async fn get_or_create_file_system(&self, ad: &str, display_name: &str) -> Result<FileSystem> {
        let fs = match self
            .client
            .get_file_system_summary_by_display_name(&self.compartment_id, ad, display_name)
            .await
        {
            Ok(fs) => {
                info!("File system {:?} already exists", display_name);
                fs
            }
            Err(e) if e.is_not_found() => {
                info!("Creating file system {:?}", display_name);
                self.client
                    .create_file_system(&CreateFileSystemDetails {
                        availability_domain: ad.to_string(),
                        compartment_id: self.compartment_id.clone(),
                        display_name: display_name.to_string(),
                    })
                    .await?
            }
            Err(e) => return Err(e),
        };
        self.client.await_file_system_active(&fs.id, self.poll).await
    }

    async fn get_or_create_export(&self, fs_id: &str, export_set_id: &str) -> Result<Export> {
        let export = match self.client.find_export(fs_id, export_set_id).await {
            Ok(export) => {
                info!("Export of {} already exists", fs_id);
                export
            }
            Err(e) if e.is_not_found() => {
                let path = format!("/{fs_id}");
                info!("Creating export {} in export set {}", path, export_set_id);
                self.client
                    .create_export(&CreateExportDetails {
                        export_set_id: export_set_id.to_string(),
                        file_system_id: fs_id.to_string(),
                        path,
                    })
                    .await?
            }
            Err(e) => return Err(e),
        };
        self.client.await_export_active(&export.id, self.poll).await
    }
}

fn annotation<'a>(volume: &'a PersistentVolume, key: &str) -> Result<&'a str> {
    volume
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .ok_or_else(|| Error::invariant(format!("{key} annotation not found on PV")))
}

#[async_trait]
impl ProvisionerPlugin for FilesystemProvisioner {
    #[instrument(skip(self, options, ad), fields(ad = %ad.name, pv = %options.pv_name))]
    async fn provision(
        &self,
        options: &ProvisionOptions,
        ad: &AvailabilityDomain,
    ) -> Result<PersistentVolume> {
        let mount_target_id = Self::mount_target_id(options)?;
        let uid = options.pvc_uid()?;
        let capacity = options.requested_storage()?;

        info!("Waiting for mount target {} to become active", mount_target_id);
        let mount_target = self
            .client
            .await_mount_target_active(mount_target_id, self.poll)
            .await?;
        let export_set_id = mount_target
            .export_set_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Error::invariant(format!("mount target {mount_target_id} has no export set"))
            })?;
        let private_ip_id = mount_target
            .private_ip_ids
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| {
                Error::invariant(format!("mount target {mount_target_id} has no private IPs"))
            })?;
        let server = self.client.get_private_ip(private_ip_id).await?.ip_address;
        debug!("Mount target {} serves NFS on {}", mount_target_id, server);

        let display_name = format!("{}{}", self.name_prefix, uid);
        let fs = self.get_or_create_file_system(&ad.name, &display_name).await?;
        let export = self.get_or_create_export(&fs.id, export_set_id).await?;

        let access_modes = options.access_modes();
        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name.clone()),
                annotations: Some(BTreeMap::from([
                    (OCI_VOLUME_ID.to_string(), fs.id.clone()),
                    (OCI_EXPORT_ID.to_string(), export.id.clone()),
                    (OCI_MOUNT_TARGET_ID.to_string(), mount_target.id.clone()),
                ])),
                labels: Some(BTreeMap::from([(
                    LABEL_ZONE_REGION.to_string(),
                    self.region.clone(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(options.reclaim_policy()),
                access_modes: Some(access_modes.clone()),
                capacity: Some(storage_capacity(capacity)),
                nfs: Some(NFSVolumeSource {
                    server,
                    path: export.path,
                    read_only: Some(is_read_only(&access_modes)),
                }),
                mount_options: options.mount_options.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let export_id = annotation(volume, OCI_EXPORT_ID)?;
        let fs_id = annotation(volume, OCI_VOLUME_ID)?;

        info!("Deleting export {}", export_id);
        match self.client.delete_export(export_id).await {
            Err(e) if e.is_not_found() => {
                info!("Export {} not found. Presuming already deleted.", export_id)
            }
            other => other?,
        }

        info!("Deleting file system {}", fs_id);
        match self.client.delete_file_system(fs_id).await {
            Err(e) if e.is_not_found() => {
                info!("File system {} not found. Presuming already deleted.", fs_id);
                Ok(())
            }
            other => other,
        }
    }
}
