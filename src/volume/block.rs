//! Block volume dialect

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{FlexPersistentVolumeSource, PersistentVolume, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::{
    parse_quantity, round_up_size, storage_capacity, ProvisionOptions, ProvisionerPlugin,
    ACCESS_MODE_RWO, LABEL_ZONE_FAILURE_DOMAIN, LABEL_ZONE_REGION,
};
use crate::error::{Error, Result};
use crate::oci::types::{AvailabilityDomain, CreateVolumeDetails, Volume, VolumeSourceDetails};
use crate::oci::{CloudClient, PollPolicy};
use crate::util::map_availability_domain_to_failure_domain;

/// PV annotation holding the volume OCID.
pub const OCI_VOLUME_ID: &str = "ociVolumeID";
/// PVC annotation naming a backup or volume to seed from.
pub const OCI_VOLUME_SOURCE: &str = "volume.beta.kubernetes.io/oci-volume-source";
pub const FS_TYPE: &str = "fsType";
pub const VOLUME_ROUNDING_ENABLED: &str = "volumeRoundingEnabled";
pub const FLEX_VOLUME_DRIVER: &str = "oracle/oci";
pub const DEFAULT_FS_TYPE: &str = "ext4";

const MIB: i64 = 1024 * 1024;

static VOLUME_BACKUP_OCID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ocid[v]?[\d+]?[\.:]volumebackup[\.:]").expect("valid volume backup pattern")
});

pub fn is_volume_backup_ocid(ocid: &str) -> bool {
    VOLUME_BACKUP_OCID.is_match(ocid)
}

/// `ext3` and `ext4` are honoured; anything else becomes `ext4`.
pub fn resolve_fs_type(parameters: &BTreeMap<String, String>) -> &str {
    match parameters.get(FS_TYPE).map(String::as_str) {
        Some(fs @ ("ext3" | "ext4")) => fs,
        Some(other) if !other.is_empty() => {
            warn!("Unsupported fsType {:?}, using {}", other, DEFAULT_FS_TYPE);
            DEFAULT_FS_TYPE
        }
        _ => DEFAULT_FS_TYPE,
    }
}

/// The storage class may turn rounding off; it is on unless it says `false`.
pub fn volume_rounding_enabled(parameters: &BTreeMap<String, String>) -> bool {
    !matches!(
        parameters.get(VOLUME_ROUNDING_ENABLED).map(String::as_str),
        Some("false" | "False" | "FALSE" | "0")
    )
}

/// Capacity to provision for `requested`, and its size in MiB.
///
/// Requests below `minimum` are raised to it when rounding is enabled.
pub fn provisioned_capacity(
    requested: &Quantity,
    minimum: &Quantity,
    rounding_enabled: bool,
) -> Result<(Quantity, i64)> {
    let requested_bytes = parse_quantity(requested)?;
    let minimum_bytes = parse_quantity(minimum)?;
    if rounding_enabled && minimum_bytes > requested_bytes {
        let size_mb = round_up_size(minimum_bytes, MIB)?;
        warn!(
            "Requested capacity {} is below the minimum {}. Rounding up to {} MiB.",
            requested.0, minimum.0, size_mb
        );
        return Ok((minimum.clone(), size_mb));
    }
    Ok((requested.clone(), round_up_size(requested_bytes, MIB)?))
}

pub struct BlockProvisioner {
    client: Arc<dyn CloudClient>,
    region: String,
    compartment_id: String,
    rounding_enabled: bool,
    min_volume_size: Quantity,
    poll: PollPolicy,
}

impl BlockProvisioner {
    pub fn new(
        client: Arc<dyn CloudClient>,
        region: &str,
        compartment_id: &str,
        rounding_enabled: bool,
        min_volume_size: Quantity,
    ) -> Result<Self> {
        parse_quantity(&min_volume_size).map_err(|e| {
            Error::ConfigError(format!("failed to parse minimum volume size: {e}"))
        })?;
        Ok(Self {
            client,
            region: region.to_string(),
            compartment_id: compartment_id.to_string(),
            rounding_enabled,
            min_volume_size,
            poll: PollPolicy::volume(),
        })
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Adopt the volume named `name` if one exists, otherwise create it.
    async fn get_or_create_volume(&self, details: &CreateVolumeDetails) -> Result<Volume> {
        let mut existing = self
            .client
            .get_volumes_by_name(&details.display_name, &self.compartment_id)
            .await?;
        match existing.len() {
            0 => {
                info!("Creating volume {:?}", details.display_name);
                self.client.create_volume(details).await
            }
            1 => {
                info!("Volume {:?} already exists", details.display_name);
                Ok(existing.remove(0))
            }
            _ => Err(Error::invariant(format!(
                "duplicate volume {:?} exists",
                details.display_name
            ))),
        }
    }
}

#[async_trait]
impl ProvisionerPlugin for BlockProvisioner {
    #[instrument(skip(self, options, ad), fields(ad = %ad.name, pv = %options.pv_name))]
    async fn provision(
        &self,
        options: &ProvisionOptions,
        ad: &AvailabilityDomain,
    ) -> Result<PersistentVolume> {
        let access_modes = options.access_modes();
        if let Some(mode) = access_modes.iter().find(|m| *m != ACCESS_MODE_RWO) {
            return Err(Error::unsupported(format!(
                "invalid access mode {mode} specified, only {ACCESS_MODE_RWO} is supported"
            )));
        }

        let rounding = self.rounding_enabled && volume_rounding_enabled(&options.parameters);
        let (capacity, size_in_mbs) = provisioned_capacity(
            &options.requested_storage()?,
            &self.min_volume_size,
            rounding,
        )?;

        let source_details = options.pvc_annotation(OCI_VOLUME_SOURCE).map(|id| {
            if is_volume_backup_ocid(id) {
                info!("Creating volume from backup {}", id);
                VolumeSourceDetails::VolumeBackup { id: id.to_string() }
            } else {
                info!("Creating volume from volume {}", id);
                VolumeSourceDetails::Volume { id: id.to_string() }
            }
        });

        let details = CreateVolumeDetails {
            availability_domain: ad.name.clone(),
            compartment_id: self.compartment_id.clone(),
            display_name: options.pvc_uid()?.to_string(),
            size_in_mbs,
            source_details,
        };
        let volume = self.get_or_create_volume(&details).await?;

        info!("Waiting for volume {} to become available", volume.id);
        let volume = match self.client.await_volume_available(&volume.id, self.poll).await {
            Ok(volume) => volume,
            Err(e) => {
                if let Err(cleanup) = self.client.delete_volume(&volume.id).await {
                    warn!("Failed to clean up volume {}: {}", volume.id, cleanup);
                }
                return Err(e);
            }
        };

        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume.id.clone()),
                annotations: Some(BTreeMap::from([(
                    OCI_VOLUME_ID.to_string(),
                    volume.id.clone(),
                )])),
                labels: Some(BTreeMap::from([
                    (LABEL_ZONE_REGION.to_string(), self.region.clone()),
                    (
                        LABEL_ZONE_FAILURE_DOMAIN.to_string(),
                        map_availability_domain_to_failure_domain(&ad.name).to_string(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(options.reclaim_policy()),
                access_modes: Some(access_modes),
                capacity: Some(storage_capacity(capacity)),
                flex_volume: Some(FlexPersistentVolumeSource {
                    driver: FLEX_VOLUME_DRIVER.to_string(),
                    fs_type: Some(resolve_fs_type(&options.parameters).to_string()),
                    ..Default::default()
                }),
                mount_options: options.mount_options.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let id = volume
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(OCI_VOLUME_ID))
            .ok_or_else(|| Error::invariant("volume id annotation not found on PV"))?;

        info!("Deleting volume {}", id);
        match self.client.delete_volume(id).await {
            Err(e) if e.is_not_found() => {
                info!("Volume {} not found. Presuming already deleted.", id);
                Ok(())
            }
            other => other,
        }
    }
}
