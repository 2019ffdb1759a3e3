//! Prometheus metrics for the OCI cloud controller
//!
//! # Exported metrics
//! - `oci_ccm_cloud_requests_total` (counter): OCI REST calls labeled by resource, verb and outcome.
//! - `oci_ccm_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `oci_ccm_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for OCI API request metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CloudRequestLabels {
    /// API resource, e.g. "loadBalancers", "securityLists"
    pub resource: String,
    /// HTTP method
    pub verb: String,
    /// "success" or "error"
    pub outcome: String,
}

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "service"
    pub controller: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see [`crate::Error::kind`]
    pub kind: String,
}

pub static CLOUD_REQUESTS_TOTAL: Lazy<Family<CloudRequestLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Reconcile latency per controller
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets. Work requests dominate the upper range.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Registry served on `/metrics`
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "oci_ccm_cloud_requests",
        "Total number of requests sent to the OCI API",
        CLOUD_REQUESTS_TOTAL.clone(),
    );
    registry.register(
        "oci_ccm_reconcile_duration_seconds",
        "Time spent in a single reconcile call",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "oci_ccm_reconcile_errors",
        "Reconcile calls that returned an error",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry
});

/// Count one OCI API request.
pub fn record_cloud_request(resource: &str, verb: &str, outcome: &str) {
    let labels = CloudRequestLabels {
        resource: resource.to_string(),
        verb: verb.to_string(),
        outcome: outcome.to_string(),
    };
    CLOUD_REQUESTS_TOTAL.get_or_create(&labels).inc();
}

/// Record how long one reconcile took.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Count a failed reconcile.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}
