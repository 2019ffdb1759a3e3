//! Kubernetes controllers
//!
//! The Service controller drives the load balancer reconciler. The volume
//! controllers drive the provisioner for claims and released volumes.

mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod service;
pub mod volume;

pub use events::{EventReporter, REPORTING_COMPONENT};
pub use service::{run_service_controller, ServiceContext, SERVICE_FINALIZER};
pub use volume::{run_volume_controllers, VolumeContext};
