//! Service controller
//!
//! Drives [`CloudLoadBalancerProvider`] from `type: LoadBalancer` Services.
//! A finalizer keeps the Service around until its load balancer is gone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::events::{EventReporter, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::cloudprovider::CloudLoadBalancerProvider;
use crate::error::{Error, Result};

/// Finalizer guarding load balancer cleanup.
pub const SERVICE_FINALIZER: &str = "oci-ccm.oraclecloud.com/load-balancer-cleanup";

/// Label excluding a node from every load balancer backend set.
pub const LABEL_EXCLUDE_FROM_LB: &str = "node.kubernetes.io/exclude-from-external-load-balancers";

const CONTROLLER_NAME: &str = "service";
const FIELD_MANAGER: &str = "oci-cloud-controller-manager";
const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";
const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Shared state for the Service controller
pub struct ServiceContext {
    pub client: Client,
    pub provider: Arc<CloudLoadBalancerProvider>,
    pub cluster_name: String,
    pub reporter: EventReporter,
}

pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some(SERVICE_TYPE_LOAD_BALANCER)
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == SERVICE_FINALIZER)
}

/// Nodes eligible as backends: Ready and not explicitly excluded.
pub fn ready_nodes(nodes: Vec<Node>) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|node| !node.labels().contains_key(LABEL_EXCLUDE_FROM_LB))
        .filter(|node| {
            node.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
        })
        .collect()
}

fn status_changed(service: &Service, desired: &LoadBalancerStatus) -> bool {
    let current = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    current.map(Vec::as_slice).unwrap_or_default()
        != desired.ingress.as_deref().unwrap_or_default()
}

/// Run the Service controller until a shutdown signal arrives.
pub async fn run_service_controller(ctx: Arc<ServiceContext>) -> Result<()> {
    let client = ctx.client.clone();
    let services: Api<Service> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    info!("Starting Service controller");

    let controller = Controller::new(services, Config::default());
    let store = controller.store();

    controller
        // Node churn changes every backend set.
        .watches(nodes, Config::default(), move |_node: Node| {
            store
                .state()
                .into_iter()
                .filter(|svc| is_load_balancer(svc) || has_finalizer(svc))
                .map(|svc| ObjectRef::from_obj(&*svc))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(ctx), fields(name = %svc.name_any(), namespace = svc.namespace()))]
async fn reconcile(svc: Arc<Service>, ctx: Arc<ServiceContext>) -> Result<Action> {
    if !is_load_balancer(&svc) && !has_finalizer(&svc) {
        return Ok(Action::await_change());
    }

    let started = Instant::now();
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = if !is_load_balancer(&svc) && svc.metadata.deletion_timestamp.is_none() {
        // No longer a LoadBalancer Service: tear down and let go.
        release_service(&ctx, &api, &svc).await
    } else {
        finalizer(&api, SERVICE_FINALIZER, svc, |event| async {
            match event {
                FinalizerEvent::Apply(svc) => apply_service(&ctx, &api, &svc).await,
                FinalizerEvent::Cleanup(svc) => cleanup_service(&ctx, &svc).await,
            }
        })
        .await
        .map_err(Error::from)
    };

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            CONTROLLER_NAME,
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &result {
            super::metrics::inc_reconcile_error(CONTROLLER_NAME, e.kind());
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    result
}

async fn apply_service(ctx: &ServiceContext, api: &Api<Service>, svc: &Service) -> Result<Action> {
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let nodes = ready_nodes(nodes.list(&ListParams::default()).await?.items);

    ctx.reporter
        .publish(svc, EVENT_TYPE_NORMAL, "EnsuringLoadBalancer", "Ensuring load balancer")
        .await;

    let status = match ctx
        .provider
        .ensure_load_balancer(&ctx.cluster_name, svc, &nodes)
        .await
    {
        Ok(status) => status,
        Err(e) => {
            ctx.reporter
                .publish(
                    svc,
                    EVENT_TYPE_WARNING,
                    "SyncLoadBalancerFailed",
                    &format!("Error syncing load balancer: {e}"),
                )
                .await;
            return Err(e);
        }
    };

    if status_changed(svc, &status) {
        let patch = json!({ "status": { "loadBalancer": status } });
        api.patch_status(
            &svc.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        info!("Updated load balancer status");
    }

    ctx.reporter
        .publish(svc, EVENT_TYPE_NORMAL, "EnsuredLoadBalancer", "Ensured load balancer")
        .await;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn cleanup_service(ctx: &ServiceContext, svc: &Service) -> Result<Action> {
    ctx.reporter
        .publish(svc, EVENT_TYPE_NORMAL, "DeletingLoadBalancer", "Deleting load balancer")
        .await;
    if let Err(e) = ctx
        .provider
        .ensure_load_balancer_deleted(&ctx.cluster_name, svc)
        .await
    {
        ctx.reporter
            .publish(
                svc,
                EVENT_TYPE_WARNING,
                "DeleteLoadBalancerFailed",
                &format!("Error deleting load balancer: {e}"),
            )
            .await;
        return Err(e);
    }
    ctx.reporter
        .publish(svc, EVENT_TYPE_NORMAL, "DeletedLoadBalancer", "Deleted load balancer")
        .await;
    Ok(Action::await_change())
}

/// Delete the load balancer of a Service whose type changed, then drop the
/// finalizer and the stale status.
async fn release_service(ctx: &ServiceContext, api: &Api<Service>, svc: &Service) -> Result<Action> {
    info!("Service is no longer of type LoadBalancer");
    cleanup_service(ctx, svc).await?;

    let finalizers: Vec<String> = svc
        .finalizers()
        .iter()
        .filter(|f| *f != SERVICE_FINALIZER)
        .cloned()
        .collect();
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &svc.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    if !status_changed(svc, &LoadBalancerStatus::default()) {
        return Ok(Action::await_change());
    }
    let patch = json!({ "status": { "loadBalancer": { "ingress": null } } });
    if let Err(e) = api
        .patch_status(&svc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!("Failed to clear load balancer status: {}", e);
    }
    Ok(Action::await_change())
}

fn error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<ServiceContext>) -> Action {
    error!("Reconciliation error for {}: {:?}", svc.name_any(), error);

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
