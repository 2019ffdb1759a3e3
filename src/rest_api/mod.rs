//! Health and metrics endpoint
//!
//! Serves `GET /healthz` for liveness checks and `GET /metrics` in the
//! OpenMetrics text format.

mod server;

pub use server::{router, run_server};
