//! Block and file storage provisioning replayed against the in-memory cloud.

mod common;

use std::sync::Arc;

use common::claim;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use oci_ccm::oci::types::{MountTarget, PrivateIp, VolumeSourceDetails, FSS_ACTIVE};
use oci_ccm::oci::FakeCloud;
use oci_ccm::volume::block::{OCI_VOLUME_ID, OCI_VOLUME_SOURCE};
use oci_ccm::volume::fss::{OCI_EXPORT_ID, OCI_MOUNT_TARGET_ID, ANNOTATION_MOUNT_TARGET_ID};
use oci_ccm::volume::{
    OciProvisioner, ProvisionOptions, ProvisionerType, VolumeSettings, LABEL_ZONE_FAILURE_DOMAIN,
    LABEL_ZONE_REGION,
};

const COMPARTMENT: &str = "ocid1.compartment.oc1..scenario";
const AD: &str = "NWuj:PHX-AD-2";
const BACKUP: &str = "ocid1.volumebackup.oc1.phx.nightly";
const MOUNT_TARGET: &str = "ocid1.mounttarget.oc1.phx.shared";
const EXPORT_SET: &str = "ocid1.exportset.oc1.phx.shared";

fn provisioner(cloud: &Arc<FakeCloud>, provisioner_type: ProvisionerType) -> OciProvisioner {
    let settings = VolumeSettings {
        provisioner_type,
        region: "us-phoenix-1".to_string(),
        compartment_id: COMPARTMENT.to_string(),
        name_prefix: "k8s-".to_string(),
        ..Default::default()
    };
    OciProvisioner::from_settings(cloud.clone(), &settings).unwrap()
}

fn options(pv_name: &str, pvc: k8s_openapi::api::core::v1::PersistentVolumeClaim) -> ProvisionOptions {
    ProvisionOptions {
        pv_name: pv_name.to_string(),
        pvc,
        ..Default::default()
    }
}

fn annotation<'a>(pv: &'a PersistentVolume, key: &str) -> &'a str {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

#[tokio::test]
async fn block_volume_restored_from_backup() {
    let cloud = Arc::new(FakeCloud::new());
    cloud.add_availability_domain(AD);
    let p = provisioner(&cloud, ProvisionerType::Block);

    let pvc = claim(
        "restore-uid",
        "50Gi",
        &["ReadWriteOnce"],
        &[(OCI_VOLUME_SOURCE, BACKUP)],
    );
    let pv = p.provision(&options("pvc-restore-uid", pvc)).await.unwrap();

    let created = cloud.state().created_volumes.clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].availability_domain, AD);
    assert_eq!(
        created[0].source_details,
        Some(VolumeSourceDetails::VolumeBackup {
            id: BACKUP.to_string()
        })
    );

    let volume = cloud.state().volumes.values().next().cloned().unwrap();
    assert_eq!(annotation(&pv, OCI_VOLUME_ID), volume.id);
    let labels = pv.metadata.labels.clone().unwrap();
    assert_eq!(labels[LABEL_ZONE_FAILURE_DOMAIN], "PHX-AD-2");
    assert_eq!(labels[LABEL_ZONE_REGION], "us-phoenix-1");
    assert_eq!(
        pv.spec.as_ref().unwrap().capacity.as_ref().unwrap()["storage"],
        Quantity("50Gi".to_string())
    );

    p.delete(&pv).await.unwrap();
    assert!(cloud.state().volumes.is_empty());
}

#[tokio::test]
async fn file_system_exported_through_mount_target() {
    let cloud = Arc::new(FakeCloud::new());
    cloud.add_availability_domain(AD);
    cloud.add_mount_target(MountTarget {
        id: MOUNT_TARGET.to_string(),
        compartment_id: COMPARTMENT.to_string(),
        availability_domain: AD.to_string(),
        private_ip_ids: vec!["ocid1.privateip.shared".to_string()],
        export_set_id: Some(EXPORT_SET.to_string()),
        lifecycle_state: FSS_ACTIVE.to_string(),
        ..Default::default()
    });
    cloud.add_private_ip(PrivateIp {
        id: "ocid1.privateip.shared".to_string(),
        ip_address: "10.0.0.5".to_string(),
        ..Default::default()
    });
    let p = provisioner(&cloud, ProvisionerType::FileSystem);

    let pvc = claim(
        "shared-uid",
        "10Gi",
        &["ReadWriteMany"],
        &[(ANNOTATION_MOUNT_TARGET_ID, MOUNT_TARGET)],
    );
    let pv = p.provision(&options("pvc-shared-uid", pvc)).await.unwrap();

    let fs = cloud.state().file_systems.values().next().cloned().unwrap();
    assert_eq!(fs.display_name, "k8s-shared-uid");
    let export = cloud.state().exports.values().next().cloned().unwrap();
    assert_eq!(export.path, format!("/{}", fs.id));
    assert_eq!(export.export_set_id, EXPORT_SET);

    let nfs = pv.spec.as_ref().and_then(|s| s.nfs.clone()).unwrap();
    assert_eq!(nfs.server, "10.0.0.5");
    assert_eq!(nfs.path, format!("/{}", fs.id));
    assert_eq!(nfs.read_only, Some(false));
    assert_eq!(annotation(&pv, OCI_VOLUME_ID), fs.id);
    assert_eq!(annotation(&pv, OCI_EXPORT_ID), export.id);
    assert_eq!(annotation(&pv, OCI_MOUNT_TARGET_ID), MOUNT_TARGET);

    p.delete(&pv).await.unwrap();
    assert!(cloud.state().exports.is_empty());
    assert!(cloud.state().file_systems.is_empty());
}
