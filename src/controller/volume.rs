//! Volume provisioning controllers
//!
//! One controller watches PersistentVolumeClaims and provisions a volume for
//! every pending claim of a storage class served by this process. A second
//! one watches PersistentVolumes and reclaims the cloud asset behind
//! released volumes whose policy is `Delete`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{
    api::{Api, DeleteParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::events::{EventReporter, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::error::{Error, Result};
use crate::volume::{OciProvisioner, ProvisionOptions, DEFAULT_RECLAIM_POLICY};

/// Annotation naming the provisioner that created a PV.
pub const ANNOTATION_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

const CLAIM_CONTROLLER: &str = "volume-claim";
const VOLUME_CONTROLLER: &str = "volume-reclaim";
const PHASE_PENDING: &str = "Pending";
const PHASE_RELEASED: &str = "Released";

/// Shared state for the volume controllers
pub struct VolumeContext {
    pub client: Client,
    pub provisioner: Arc<OciProvisioner>,
    /// Storage class provisioner name served by this process.
    pub provisioner_name: String,
    pub reporter: EventReporter,
}

/// Unbound claims still waiting for a volume.
pub fn needs_provisioning(pvc: &PersistentVolumeClaim) -> bool {
    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
    let bound = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .is_some_and(|v| !v.is_empty());
    pvc.metadata.deletion_timestamp.is_none()
        && !bound
        && matches!(phase, None | Some(PHASE_PENDING))
}

/// Released volumes of ours that should be deleted.
pub fn should_reclaim(pv: &PersistentVolume, provisioner_name: &str) -> bool {
    let released = pv
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some(PHASE_RELEASED);
    let policy = pv
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        .unwrap_or(DEFAULT_RECLAIM_POLICY);
    let ours = pv.annotations().get(ANNOTATION_PROVISIONED_BY).map(String::as_str)
        == Some(provisioner_name);
    released && policy == DEFAULT_RECLAIM_POLICY && ours && pv.metadata.deletion_timestamp.is_none()
}

/// Bind a freshly provisioned PV to its claim and storage class.
pub fn prepare_volume(
    mut pv: PersistentVolume,
    pvc: &PersistentVolumeClaim,
    class_name: &str,
    provisioner_name: &str,
) -> PersistentVolume {
    pv.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            ANNOTATION_PROVISIONED_BY.to_string(),
            provisioner_name.to_string(),
        );
    let spec = pv.spec.get_or_insert_with(Default::default);
    spec.storage_class_name = Some(class_name.to_string());
    spec.claim_ref = Some(ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: pvc.namespace(),
        name: pvc.metadata.name.clone(),
        uid: pvc.metadata.uid.clone(),
        resource_version: pvc.metadata.resource_version.clone(),
        ..Default::default()
    });
    pv
}

fn observe(controller: &str, started: Instant, result: &Result<Action>) {
    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            controller,
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = result {
            super::metrics::inc_reconcile_error(controller, e.kind());
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (controller, started, result);
}

/// Run both volume controllers until a shutdown signal arrives.
pub async fn run_volume_controllers(ctx: Arc<VolumeContext>) -> Result<()> {
    let claims: Api<PersistentVolumeClaim> = Api::all(ctx.client.clone());
    let volumes: Api<PersistentVolume> = Api::all(ctx.client.clone());

    info!(
        "Starting volume controllers for provisioner {}",
        ctx.provisioner_name
    );

    let claim_controller = Controller::new(claims, Config::default())
        .shutdown_on_signal()
        .run(reconcile_claim, claim_error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled claim: {:?}", obj),
                Err(e) => error!("Claim reconcile error: {:?}", e),
            }
        });

    let volume_controller = Controller::new(volumes, Config::default())
        .shutdown_on_signal()
        .run(reconcile_volume, volume_error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled volume: {:?}", obj),
                Err(e) => error!("Volume reconcile error: {:?}", e),
            }
        });

    futures::join!(claim_controller, volume_controller);
    Ok(())
}

#[instrument(skip(ctx), fields(name = %pvc.name_any(), namespace = pvc.namespace()))]
async fn reconcile_claim(pvc: Arc<PersistentVolumeClaim>, ctx: Arc<VolumeContext>) -> Result<Action> {
    if !needs_provisioning(&pvc) {
        return Ok(Action::await_change());
    }
    let Some(class_name) = pvc
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone())
        .filter(|c| !c.is_empty())
    else {
        return Ok(Action::await_change());
    };

    let classes: Api<StorageClass> = Api::all(ctx.client.clone());
    let class = match classes.get(&class_name).await {
        Ok(class) => class,
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            debug!("Storage class {} not found", class_name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };
    if class.provisioner != ctx.provisioner_name {
        return Ok(Action::await_change());
    }

    let started = Instant::now();
    let result = provision_claim(&ctx, &pvc, &class_name, &class).await;
    observe(CLAIM_CONTROLLER, started, &result);
    result
}

async fn provision_claim(
    ctx: &VolumeContext,
    pvc: &PersistentVolumeClaim,
    class_name: &str,
    class: &StorageClass,
) -> Result<Action> {
    let uid = pvc
        .metadata
        .uid
        .as_deref()
        .ok_or_else(|| Error::invariant("claim has no UID"))?;
    let options = ProvisionOptions::new(format!("pvc-{uid}"), pvc.clone(), class);

    info!("Provisioning volume for claim");
    let pv = match ctx.provisioner.provision(&options).await {
        Ok(pv) => pv,
        Err(e) => {
            ctx.reporter
                .publish(
                    pvc,
                    EVENT_TYPE_WARNING,
                    "ProvisioningFailed",
                    &format!("Failed to provision volume with StorageClass {class_name:?}: {e}"),
                )
                .await;
            return Err(e);
        }
    };
    let pv = prepare_volume(pv, pvc, class_name, &ctx.provisioner_name);
    let pv_name = pv.name_any();

    let volumes: Api<PersistentVolume> = Api::all(ctx.client.clone());
    match volumes.create(&PostParams::default(), &pv).await {
        Ok(_) => info!("Created PV {}", pv_name),
        Err(kube::Error::Api(resp)) if resp.code == 409 => {
            info!("PV {} already exists", pv_name)
        }
        Err(e) => return Err(e.into()),
    }

    ctx.reporter
        .publish(
            pvc,
            EVENT_TYPE_NORMAL,
            "ProvisioningSucceeded",
            &format!("Successfully provisioned volume {pv_name}"),
        )
        .await;
    Ok(Action::await_change())
}

#[instrument(skip(ctx), fields(name = %pv.name_any()))]
async fn reconcile_volume(pv: Arc<PersistentVolume>, ctx: Arc<VolumeContext>) -> Result<Action> {
    if !should_reclaim(&pv, &ctx.provisioner_name) {
        return Ok(Action::await_change());
    }

    let started = Instant::now();
    let result = reclaim_volume(&ctx, &pv).await;
    observe(VOLUME_CONTROLLER, started, &result);
    result
}

async fn reclaim_volume(ctx: &VolumeContext, pv: &PersistentVolume) -> Result<Action> {
    info!("Deleting released volume");
    match ctx.provisioner.delete(pv).await {
        Ok(()) => {}
        Err(Error::Unsupported(msg)) => {
            warn!("Not reclaiming volume: {}", msg);
            return Ok(Action::await_change());
        }
        Err(e) => {
            ctx.reporter
                .publish(
                    pv,
                    EVENT_TYPE_WARNING,
                    "VolumeFailedDelete",
                    &format!("Failed to delete volume: {e}"),
                )
                .await;
            return Err(e);
        }
    }

    let volumes: Api<PersistentVolume> = Api::all(ctx.client.clone());
    match volumes.delete(&pv.name_any(), &DeleteParams::default()).await {
        Ok(_) => info!("Deleted PV"),
        Err(kube::Error::Api(resp)) if resp.code == 404 => debug!("PV already gone"),
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}

fn requeue_after(error: &Error) -> Action {
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry_duration)
}

fn claim_error_policy(pvc: Arc<PersistentVolumeClaim>, error: &Error, _ctx: Arc<VolumeContext>) -> Action {
    error!("Provisioning error for {}: {:?}", pvc.name_any(), error);
    requeue_after(error)
}

fn volume_error_policy(pv: Arc<PersistentVolume>, error: &Error, _ctx: Arc<VolumeContext>) -> Action {
    error!("Reclaim error for {}: {:?}", pv.name_any(), error);
    requeue_after(error)
}
