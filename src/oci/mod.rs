//! Oracle Cloud Infrastructure client facade
//!
//! The reconcilers only see the capability traits in [`client`]. Two
//! implementations exist: [`OciHttpClient`] talks to the real REST API and
//! [`FakeCloud`] keeps everything in memory for tests and dry runs.

pub mod auth;
pub mod cache;
pub mod client;
pub mod fake;
pub mod http;
#[cfg(test)]
mod http_test;
pub mod poll;
pub mod types;

pub use auth::RequestSigner;
pub use cache::SubnetCache;
pub use client::{
    is_instance_in_terminal_state, BlockStorageClient, CloudClient, ComputeClient,
    FileStorageClient, IdentityClient, LoadBalancerClient, NetworkingClient,
};
pub use fake::FakeCloud;
pub use http::{Endpoints, OciHttpClient};
pub use poll::{poll_until, PollPolicy};
