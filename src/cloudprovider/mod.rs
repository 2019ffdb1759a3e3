//! Cloud provider surface for Services and Nodes
//!
//! [`CloudLoadBalancerProvider`] turns a `type: LoadBalancer` Service into an
//! OCI load balancer plus the security rules it needs. [`Instances`] answers
//! node metadata questions from the compute API. [`Routes`] points pod CIDRs
//! at node private IPs.

pub mod instances;
pub mod load_balancer;
pub mod load_balancer_spec;
pub mod load_balancer_util;
pub mod routes;
pub mod secrets;
pub mod security_lists;

pub use instances::{Instances, Zone};
pub use load_balancer::{load_balancer_to_status, CloudLoadBalancerProvider};
pub use load_balancer_spec::{LbSpec, SpecDefaults, LB_NAME_PREFIX_ENV};
pub use load_balancer_util::{sort_and_combine_actions, Action, ActionType};
pub use routes::Routes;
pub use secrets::{KubeSecretReader, SecretReader, StaticSecretReader, TlsSecret};
pub use security_lists::{
    new_security_list_manager, DefaultSecurityListManager, FrontendSecurityListManager,
    NoopSecurityListManager, RulePorts, SecurityListManager,
};
