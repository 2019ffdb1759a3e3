//! Dynamic volume provisioning
//!
//! Two dialects implement [`ProvisionerPlugin`]: [`block::BlockProvisioner`]
//! for block volumes and [`fss::FilesystemProvisioner`] for NFS exports.
//! [`OciProvisioner`] picks the availability domain, delegates to the
//! configured dialect and stamps ownership annotations on the result.

pub mod block;
#[cfg(test)]
mod block_test;
pub mod fss;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use rand::seq::SliceRandom;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::oci::types::AvailabilityDomain;
use crate::oci::CloudClient;
use crate::util::map_availability_domain_to_failure_domain;

pub const PROVISIONER_NAME_DEFAULT: &str = "oracle.com/oci";
pub const PROVISIONER_NAME_BLOCK: &str = "oracle.com/oci-block";
pub const PROVISIONER_NAME_FSS: &str = "oracle.com/oci-fss";

pub const OCI_PROVISIONER_IDENTITY: &str = "ociProvisionerIdentity";
pub const OCI_AVAILABILITY_DOMAIN: &str = "ociAvailabilityDomain";
pub const OCI_COMPARTMENT: &str = "ociCompartment";

pub const LABEL_ZONE_REGION: &str = "failure-domain.beta.kubernetes.io/region";
pub const LABEL_ZONE_FAILURE_DOMAIN: &str = "failure-domain.beta.kubernetes.io/zone";

pub const DEFAULT_MIN_VOLUME_SIZE: &str = "50Gi";
pub const DEFAULT_RECLAIM_POLICY: &str = "Delete";

pub const ACCESS_MODE_RWO: &str = "ReadWriteOnce";
pub const ACCESS_MODE_ROX: &str = "ReadOnlyMany";

const STORAGE: &str = "storage";

/// Storage dialect served by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerType {
    Block,
    FileSystem,
}

impl ProvisionerType {
    /// Parse a provisioner name. `oracle.com/oci` is an alias for block.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            PROVISIONER_NAME_DEFAULT | PROVISIONER_NAME_BLOCK => Ok(Self::Block),
            PROVISIONER_NAME_FSS => Ok(Self::FileSystem),
            other => Err(Error::ConfigError(format!(
                "invalid provisioner type {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ProvisionerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionerType::Block => f.write_str("block"),
            ProvisionerType::FileSystem => f.write_str("fss"),
        }
    }
}

/// Everything a dialect needs to provision one claim.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    pub pv_name: String,
    pub pvc: PersistentVolumeClaim,
    pub parameters: BTreeMap<String, String>,
    pub reclaim_policy: Option<String>,
    pub mount_options: Option<Vec<String>>,
}

impl ProvisionOptions {
    pub fn new(pv_name: impl Into<String>, pvc: PersistentVolumeClaim, class: &StorageClass) -> Self {
        Self {
            pv_name: pv_name.into(),
            pvc,
            parameters: class.parameters.clone().unwrap_or_default(),
            reclaim_policy: class.reclaim_policy.clone(),
            mount_options: class.mount_options.clone(),
        }
    }

    pub fn pvc_uid(&self) -> Result<&str> {
        self.pvc
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| Error::invariant("claim has no UID"))
    }

    pub fn pvc_annotation(&self, key: &str) -> Option<&str> {
        self.pvc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn access_modes(&self) -> Vec<String> {
        self.pvc
            .spec
            .as_ref()
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default()
    }

    /// The claim's storage request.
    pub fn requested_storage(&self) -> Result<Quantity> {
        self.pvc
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get(STORAGE))
            .cloned()
            .ok_or_else(|| Error::validation("could not determine volume size for claim"))
    }

    pub fn reclaim_policy(&self) -> String {
        self.reclaim_policy
            .clone()
            .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.to_string())
    }
}

/// Capacity map with a single `storage` entry.
pub(crate) fn storage_capacity(quantity: Quantity) -> BTreeMap<String, Quantity> {
    BTreeMap::from([(STORAGE.to_string(), quantity)])
}

/// Bytes in a Kubernetes quantity such as `50Gi`, `1G` or `1073741824`.
pub fn parse_quantity(quantity: &Quantity) -> Result<i64> {
    const SUFFIXES: [(&str, f64); 12] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let raw = quantity.0.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, m)| raw.strip_suffix(suffix).map(|n| (n, *m)))
        .unwrap_or((raw, 1.0));

    let value: f64 = number
        .parse()
        .map_err(|_| Error::validation(format!("invalid quantity {raw:?}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::validation(format!("invalid quantity {raw:?}")));
    }
    let bytes = (value * multiplier).ceil();
    // i64::MAX is not representable as f64; the nearest value is 2^63.
    if bytes >= i64::MAX as f64 {
        return Err(Error::validation(format!("quantity {raw:?} is too large")));
    }
    Ok(bytes as i64)
}

/// `bytes` expressed in `unit`-sized allocations, rounded up.
pub fn round_up_size(bytes: i64, unit: i64) -> Result<i64> {
    if bytes < 0 || unit <= 0 {
        return Err(Error::validation(format!(
            "cannot round {bytes} bytes to units of {unit}"
        )));
    }
    bytes
        .checked_add(unit - 1)
        .map(|b| b / unit)
        .ok_or_else(|| Error::validation(format!("size of {bytes} bytes is too large")))
}

#[async_trait]
pub trait ProvisionerPlugin: Send + Sync {
    /// Create the storage asset in `ad` and describe it as a PV.
    async fn provision(
        &self,
        options: &ProvisionOptions,
        ad: &AvailabilityDomain,
    ) -> Result<PersistentVolume>;

    /// Destroy the asset behind a PV this dialect provisioned.
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;
}

/// Process-level volume settings, from the CLI.
#[derive(Debug, Clone)]
pub struct VolumeSettings {
    pub provisioner_type: ProvisionerType,
    pub region: String,
    pub compartment_id: String,
    pub rounding_enabled: bool,
    pub min_volume_size: Quantity,
    /// Prepended to file-system display names.
    pub name_prefix: String,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            provisioner_type: ProvisionerType::Block,
            region: String::new(),
            compartment_id: String::new(),
            rounding_enabled: true,
            min_volume_size: Quantity(DEFAULT_MIN_VOLUME_SIZE.to_string()),
            name_prefix: String::new(),
        }
    }
}

pub struct OciProvisioner {
    client: Arc<dyn CloudClient>,
    plugin: Arc<dyn ProvisionerPlugin>,
    compartment_id: String,
}

impl OciProvisioner {
    pub fn new(
        client: Arc<dyn CloudClient>,
        plugin: Arc<dyn ProvisionerPlugin>,
        compartment_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            plugin,
            compartment_id: compartment_id.into(),
        }
    }

    /// Build the dialect selected by `settings`.
    pub fn from_settings(client: Arc<dyn CloudClient>, settings: &VolumeSettings) -> Result<Self> {
        let plugin: Arc<dyn ProvisionerPlugin> = match settings.provisioner_type {
            ProvisionerType::Block => Arc::new(block::BlockProvisioner::new(
                client.clone(),
                &settings.region,
                &settings.compartment_id,
                settings.rounding_enabled,
                settings.min_volume_size.clone(),
            )?),
            ProvisionerType::FileSystem => Arc::new(fss::FilesystemProvisioner::new(
                client.clone(),
                &settings.region,
                &settings.compartment_id,
                &settings.name_prefix,
            )),
        };
        info!(
            "Volume provisioner running in {} mode",
            settings.provisioner_type
        );
        Ok(Self::new(client, plugin, settings.compartment_id.clone()))
    }

    /// Zone requested through the claim's selector, if any.
    fn requested_zone(pvc: &PersistentVolumeClaim) -> Option<&str> {
        pvc.spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.as_ref())
            .and_then(|l| l.get(LABEL_ZONE_FAILURE_DOMAIN))
            .map(String::as_str)
    }

    /// The AD named by the claim's zone selector, or a random one.
    pub async fn choose_availability_domain(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<AvailabilityDomain> {
        let ads = self
            .client
            .list_availability_domains(&self.compartment_id)
            .await?;

        if let Some(zone) = Self::requested_zone(pvc) {
            return ads
                .into_iter()
                .find(|ad| {
                    ad.name == zone || map_availability_domain_to_failure_domain(&ad.name) == zone
                })
                .ok_or_else(|| {
                    Error::not_found(format!("availability domain for zone {zone:?}"))
                });
        }

        ads.choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "no availability domains in compartment {}",
                    self.compartment_id
                ))
            })
    }

    #[instrument(skip(self, options), fields(pv = %options.pv_name))]
    pub async fn provision(&self, options: &ProvisionOptions) -> Result<PersistentVolume> {
        let ad = self.choose_availability_domain(&options.pvc).await?;
        info!("Provisioning volume in availability domain {}", ad.name);
        let mut pv = self.plugin.provision(options, &ad).await?;

        let annotations = pv.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(
            OCI_PROVISIONER_IDENTITY.to_string(),
            OCI_PROVISIONER_IDENTITY.to_string(),
        );
        annotations.insert(OCI_AVAILABILITY_DOMAIN.to_string(), ad.name.clone());
        annotations.insert(OCI_COMPARTMENT.to_string(), self.compartment_id.clone());
        pv.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(
                LABEL_ZONE_FAILURE_DOMAIN.to_string(),
                map_availability_domain_to_failure_domain(&ad.name).to_string(),
            );
        Ok(pv)
    }

    /// Delete the asset behind `volume`. PVs owned by another provisioner are
    /// refused with [`Error::Unsupported`].
    #[instrument(skip(self, volume), fields(pv = volume.metadata.name.as_deref()))]
    pub async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let identity = volume
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(OCI_PROVISIONER_IDENTITY))
            .ok_or_else(|| Error::invariant("identity annotation not found on PV"))?;
        if identity != OCI_PROVISIONER_IDENTITY {
            warn!("Ignoring PV with foreign identity {:?}", identity);
            return Err(Error::unsupported(
                "identity annotation on PV does not match ours",
            ));
        }
        self.plugin.delete(volume).await
    }
}
