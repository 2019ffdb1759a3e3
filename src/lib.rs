//! OCI cloud controller manager
//!
//! Reconciles Kubernetes `LoadBalancer` Services into Oracle Cloud
//! Infrastructure load balancers and security-list rules, and provisions
//! block volumes and NFS file systems for PersistentVolumeClaims.

pub mod cloudprovider;
pub mod config;
pub mod controller;
pub mod error;
pub mod oci;
pub mod telemetry;
pub mod util;
pub mod volume;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
