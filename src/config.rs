//! Provider configuration
//!
//! The controller reads a single YAML document (by default
//! `/etc/oci/config.yaml`) describing how to authenticate against OCI and
//! where load balancers are placed. Loading is split into three steps:
//! parse, [`Config::complete`] (defaults and deprecated fallbacks) and
//! [`Config::validate`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default location of the provider configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/oci/config.yaml";

/// How much of the security-list plumbing the controller owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityListManagementMode {
    /// Manage LB-subnet ingress/egress and worker-subnet ingress.
    All,
    /// Manage LB-subnet ingress only.
    Frontend,
    /// Leave security lists alone.
    None,
}

impl SecurityListManagementMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "All" => Some(Self::All),
            "Frontend" => Some(Self::Frontend),
            "None" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityListManagementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "All",
            Self::Frontend => "Frontend",
            Self::None => "None",
        };
        f.write_str(s)
    }
}

/// Credentials and region used to talk to the OCI API.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub use_instance_principals: bool,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub region_key: String,
    #[serde(default)]
    pub tenancy: String,
    /// Deprecated: use the top-level `compartment`.
    #[serde(default)]
    pub compartment: String,
    #[serde(default)]
    pub user: String,
    /// PEM encoded API signing key.
    #[serde(default, rename = "key")]
    pub private_key: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub passphrase: String,
    /// Deprecated: use `passphrase`.
    #[serde(default, rename = "key_passphrase")]
    pub private_key_passphrase: String,
}

// Keep key material out of logs.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("use_instance_principals", &self.use_instance_principals)
            .field("region", &self.region)
            .field("tenancy", &self.tenancy)
            .field("user", &self.user)
            .field("fingerprint", &self.fingerprint)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Deprecated: use `securityListManagementMode: None`.
    #[serde(default)]
    pub disable_security_list_management: bool,
    #[serde(default)]
    pub security_list_management_mode: String,
    #[serde(default)]
    pub subnet1: String,
    #[serde(default)]
    pub subnet2: String,
    /// Subnet OCID to security-list OCID overrides.
    #[serde(default)]
    pub security_lists: BTreeMap<String, String>,
}

impl LoadBalancerConfig {
    /// Effective management mode. Only meaningful after [`Config::complete`].
    pub fn mode(&self) -> SecurityListManagementMode {
        SecurityListManagementMode::parse(&self.security_list_management_mode)
            .unwrap_or(SecurityListManagementMode::All)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub compartment: String,
    #[serde(default)]
    pub vcn: String,
}

impl Config {
    /// Parse without completing or validating.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read, complete and validate the auth/compartment parts of a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading provider configuration from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("reading {}: {}", path.display(), e))
        })?;
        let mut cfg = Self::from_yaml(&contents)?;
        cfg.complete();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fill defaults and migrate deprecated fields.
    pub fn complete(&mut self) {
        let lb = &mut self.load_balancer;
        if lb.disable_security_list_management {
            warn!(
                "disableSecurityListManagement is deprecated, use securityListManagementMode: None"
            );
            lb.security_list_management_mode = SecurityListManagementMode::None.to_string();
        } else if lb.security_list_management_mode.is_empty() {
            lb.security_list_management_mode = SecurityListManagementMode::All.to_string();
        }

        if self.compartment.is_empty() && !self.auth.compartment.is_empty() {
            warn!("auth.compartment is deprecated, use the top-level compartment");
            self.compartment = self.auth.compartment.clone();
        }
        if self.auth.passphrase.is_empty() && !self.auth.private_key_passphrase.is_empty() {
            warn!("auth.key_passphrase is deprecated, use auth.passphrase");
            self.auth.passphrase = self.auth.private_key_passphrase.clone();
        }
    }

    /// Check authentication and placement fields. All problems are reported at once.
    pub fn validate(&self) -> Result<()> {
        into_result(self.base_problems())
    }

    /// [`Config::validate`] plus the load balancer block.
    pub fn validate_for_load_balancing(&self) -> Result<()> {
        let mut problems = self.base_problems();
        let lb = &self.load_balancer;
        if lb.subnet1.is_empty() {
            problems.push("loadBalancer.subnet1: Required value".to_string());
        }
        if lb.subnet2.is_empty() {
            problems.push("loadBalancer.subnet2: Required value".to_string());
        }
        if SecurityListManagementMode::parse(&lb.security_list_management_mode).is_none() {
            problems.push(format!(
                "loadBalancer.securityListManagementMode: Invalid value {:?}, must be one of All, Frontend, None",
                lb.security_list_management_mode
            ));
        }
        into_result(problems)
    }
}

impl Config {
    fn base_problems(&self) -> Vec<String> {
        let mut problems = validate_auth(&self.auth);
        if self.compartment.is_empty() {
            problems.push("compartment: Required value".to_string());
        }
        if self.vcn.is_empty() {
            problems.push("vcn: Required value".to_string());
        }
        problems
    }
}

fn validate_auth(auth: &AuthConfig) -> Vec<String> {
    let mut problems = Vec::new();
    let fields = [
        ("region", &auth.region),
        ("tenancy", &auth.tenancy),
        ("user", &auth.user),
        ("key", &auth.private_key),
        ("fingerprint", &auth.fingerprint),
    ];

    if auth.use_instance_principals {
        for (name, value) in fields {
            if !value.is_empty() {
                problems.push(format!(
                    "auth.{name}: Forbidden when useInstancePrincipals is true"
                ));
            }
        }
    } else {
        for (name, value) in fields {
            if value.is_empty() {
                problems.push(format!("auth.{name}: Required value"));
            }
        }
    }
    problems
}

fn into_result(problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::ConfigError(problems.join("; ")))
    }
}
