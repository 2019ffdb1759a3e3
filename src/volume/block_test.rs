//! Unit tests for the block volume dialect.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{
        PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    use crate::error::Error;
    use crate::oci::types::{AvailabilityDomain, Volume, VolumeSourceDetails, VOLUME_FAULTY};
    use crate::oci::FakeCloud;
    use crate::volume::block::*;
    use crate::volume::{ProvisionOptions, ProvisionerPlugin, LABEL_ZONE_FAILURE_DOMAIN, LABEL_ZONE_REGION};

    const UID: &str = "6e1d4f2a-claim";
    const COMPARTMENT: &str = "ocid1.compartment.oc1..test";
    const GIB_MB: i64 = 1024;

    fn ad() -> AvailabilityDomain {
        AvailabilityDomain {
            name: "NWuj:PHX-AD-1".to_string(),
            compartment_id: COMPARTMENT.to_string(),
        }
    }

    fn claim(storage: &str, modes: &[&str]) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                namespace: Some("default".to_string()),
                uid: Some(UID.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(modes.iter().map(|m| m.to_string()).collect()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn options(pvc: PersistentVolumeClaim) -> ProvisionOptions {
        ProvisionOptions {
            pv_name: "pvc-1".to_string(),
            pvc,
            ..Default::default()
        }
    }

    fn provisioner(cloud: &Arc<FakeCloud>, rounding: bool) -> BlockProvisioner {
        BlockProvisioner::new(
            cloud.clone(),
            "us-phoenix-1",
            COMPARTMENT,
            rounding,
            Quantity("50Gi".to_string()),
        )
        .unwrap()
    }

    fn annotated(pvc: PersistentVolumeClaim, key: &str, value: &str) -> PersistentVolumeClaim {
        let mut pvc = pvc;
        pvc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        pvc
    }

    #[test]
    fn test_backup_ocid_detection() {
        assert!(is_volume_backup_ocid("ocid1.volumebackup.oc1.phx.abc"));
        assert!(is_volume_backup_ocid("ocidv1:volumebackup:oc1:phx:abc"));
        assert!(!is_volume_backup_ocid("ocid1.volume.oc1.phx.abc"));
        assert!(!is_volume_backup_ocid("volumebackup"));
    }

    #[test]
    fn test_fs_type_resolution() {
        let params = |v: &str| BTreeMap::from([(FS_TYPE.to_string(), v.to_string())]);
        assert_eq!(resolve_fs_type(&BTreeMap::new()), "ext4");
        assert_eq!(resolve_fs_type(&params("ext3")), "ext3");
        assert_eq!(resolve_fs_type(&params("xfs")), "ext4");
    }

    #[test]
    fn test_capacity_rounding() {
        let q = |s: &str| Quantity(s.to_string());

        let (capacity, size_mb) = provisioned_capacity(&q("10Gi"), &q("50Gi"), true).unwrap();
        assert_eq!(capacity, q("50Gi"));
        assert_eq!(size_mb, 50 * GIB_MB);

        let (capacity, size_mb) = provisioned_capacity(&q("10Gi"), &q("50Gi"), false).unwrap();
        assert_eq!(capacity, q("10Gi"));
        assert_eq!(size_mb, 10 * GIB_MB);

        let (capacity, size_mb) = provisioned_capacity(&q("100Gi"), &q("50Gi"), true).unwrap();
        assert_eq!(capacity, q("100Gi"));
        assert_eq!(size_mb, 100 * GIB_MB);

        let (_, size_mb) = provisioned_capacity(&q("1500k"), &q("1Mi"), true).unwrap();
        assert_eq!(size_mb, 2);
    }

    #[test]
    fn test_rounding_can_be_disabled_by_class() {
        let params = |v: &str| BTreeMap::from([(VOLUME_ROUNDING_ENABLED.to_string(), v.to_string())]);
        assert!(volume_rounding_enabled(&BTreeMap::new()));
        assert!(volume_rounding_enabled(&params("true")));
        assert!(!volume_rounding_enabled(&params("false")));
    }

    #[test]
    fn test_invalid_minimum_is_a_config_error() {
        let err = BlockProvisioner::new(
            Arc::new(FakeCloud::new()),
            "us-phoenix-1",
            COMPARTMENT,
            true,
            Quantity("fifty".to_string()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_provision_small_claim_is_rounded_up() {
        let cloud = Arc::new(FakeCloud::new());
        let pv = provisioner(&cloud, true)
            .provision(&options(claim("10Gi", &["ReadWriteOnce"])), &ad())
            .await
            .unwrap();

        let created = cloud.state().created_volumes.clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].size_in_mbs, 50 * GIB_MB);
        assert_eq!(created[0].display_name, UID);
        assert_eq!(created[0].availability_domain, "NWuj:PHX-AD-1");

        let spec = pv.spec.unwrap();
        assert_eq!(spec.capacity.unwrap()["storage"], Quantity("50Gi".to_string()));
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce".to_string()]);
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
        let flex = spec.flex_volume.unwrap();
        assert_eq!(flex.driver, FLEX_VOLUME_DRIVER);
        assert_eq!(flex.fs_type.as_deref(), Some("ext4"));

        let volume_id = created_volume_id(&cloud);
        assert_eq!(pv.metadata.name.as_deref(), Some(volume_id.as_str()));
        assert_eq!(pv.metadata.annotations.unwrap()[OCI_VOLUME_ID], volume_id);
        let labels = pv.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_ZONE_REGION], "us-phoenix-1");
        assert_eq!(labels[LABEL_ZONE_FAILURE_DOMAIN], "PHX-AD-1");
    }

    fn created_volume_id(cloud: &FakeCloud) -> String {
        cloud
            .state()
            .volumes
            .keys()
            .next()
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_provision_from_backup() {
        let cloud = Arc::new(FakeCloud::new());
        let pvc = annotated(
            claim("60Gi", &["ReadWriteOnce"]),
            OCI_VOLUME_SOURCE,
            "ocid1.volumebackup.oc1.phx.backup",
        );
        provisioner(&cloud, true)
            .provision(&options(pvc), &ad())
            .await
            .unwrap();

        let created = cloud.state().created_volumes.clone();
        assert_eq!(
            created[0].source_details,
            Some(VolumeSourceDetails::VolumeBackup {
                id: "ocid1.volumebackup.oc1.phx.backup".to_string()
            })
        );
        assert_eq!(created[0].size_in_mbs, 60 * GIB_MB);
    }

    #[tokio::test]
    async fn test_provision_clone_of_volume() {
        let cloud = Arc::new(FakeCloud::new());
        let pvc = annotated(
            claim("60Gi", &["ReadWriteOnce"]),
            OCI_VOLUME_SOURCE,
            "ocid1.volume.oc1.phx.source",
        );
        provisioner(&cloud, true)
            .provision(&options(pvc), &ad())
            .await
            .unwrap();

        assert_eq!(
            cloud.state().created_volumes[0].source_details,
            Some(VolumeSourceDetails::Volume {
                id: "ocid1.volume.oc1.phx.source".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_reprovision_adopts_existing_volume() {
        let cloud = Arc::new(FakeCloud::new());
        let p = provisioner(&cloud, true);
        let opts = options(claim("50Gi", &["ReadWriteOnce"]));

        let first = p.provision(&opts, &ad()).await.unwrap();
        let second = p.provision(&opts, &ad()).await.unwrap();

        assert_eq!(first.metadata.name, second.metadata.name);
        assert_eq!(cloud.state().created_volumes.len(), 1);
        assert_eq!(cloud.state().volumes.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_volumes_are_an_invariant_violation() {
        let cloud = Arc::new(FakeCloud::new());
        for id in ["ocid1.volume.a", "ocid1.volume.b"] {
            cloud.state().volumes.insert(
                id.to_string(),
                Volume {
                    id: id.to_string(),
                    display_name: UID.to_string(),
                    compartment_id: COMPARTMENT.to_string(),
                    lifecycle_state: "AVAILABLE".to_string(),
                    ..Default::default()
                },
            );
        }

        let err = provisioner(&cloud, true)
            .provision(&options(claim("50Gi", &["ReadWriteOnce"])), &ad())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert!(cloud.state().created_volumes.is_empty());
    }

    #[tokio::test]
    async fn test_faulty_volume_is_deleted() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.state().new_volume_state = VOLUME_FAULTY.to_string();

        let err = provisioner(&cloud, true)
            .provision(&options(claim("50Gi", &["ReadWriteOnce"])), &ad())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));

        let calls = cloud.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], format!("CreateVolume {UID}"));
        assert!(calls[1].starts_with("DeleteVolume "));
        assert!(cloud.state().volumes.is_empty());
    }

    #[tokio::test]
    async fn test_only_read_write_once_is_supported() {
        let cloud = Arc::new(FakeCloud::new());
        let err = provisioner(&cloud, true)
            .provision(&options(claim("50Gi", &["ReadWriteMany"])), &ad())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_claim_is_rejected() {
        let cloud = Arc::new(FakeCloud::new());
        let err = provisioner(&cloud, true)
            .provision(&options(claim("8Ei", &["ReadWriteOnce"])), &ad())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(cloud.calls().is_empty());

        let q = |s: &str| Quantity(s.to_string());
        assert!(matches!(
            provisioned_capacity(&q("50Gi"), &q("8Ei"), true),
            Err(Error::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_without_size_is_rejected() {
        let cloud = Arc::new(FakeCloud::new());
        let mut pvc = claim("50Gi", &["ReadWriteOnce"]);
        if let Some(spec) = pvc.spec.as_mut() {
            spec.resources = None;
        }
        let err = provisioner(&cloud, true)
            .provision(&options(pvc), &ad())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let cloud = Arc::new(FakeCloud::new());
        let p = provisioner(&cloud, true);
        let pv = p
            .provision(&options(claim("50Gi", &["ReadWriteOnce"])), &ad())
            .await
            .unwrap();

        p.delete(&pv).await.unwrap();
        assert!(cloud.state().volumes.is_empty());

        // Already gone.
        p.delete(&pv).await.unwrap();

        let err = p.delete(&PersistentVolume::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }
}
