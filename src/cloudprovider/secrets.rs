//! TLS material for SSL-terminating listeners

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::{debug, warn};
use x509_parser::pem::parse_x509_pem;

use crate::error::{Error, Result};

pub const SSL_CERTIFICATE_KEY: &str = "tls.crt";
pub const SSL_PRIVATE_KEY_KEY: &str = "tls.key";
pub const SSL_CA_CERTIFICATE_KEY: &str = "ca.crt";

/// Decoded contents of a `kubernetes.io/tls` secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsSecret {
    pub certificate: String,
    pub private_key: String,
    pub ca_certificate: Option<String>,
}

impl std::fmt::Debug for TlsSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSecret")
            .field("ca_certificate", &self.ca_certificate.is_some())
            .finish_non_exhaustive()
    }
}

impl TlsSecret {
    /// Build from secret data, requiring `tls.crt` and `tls.key`.
    pub fn from_data(
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Self> {
        let field = |key: &str| -> Result<Option<String>> {
            data.get(key)
                .map(|bytes| {
                    String::from_utf8(bytes.clone()).map_err(|_| {
                        Error::validation(format!("{key} in secret {namespace}/{name} is not UTF-8"))
                    })
                })
                .transpose()
        };
        let missing =
            |key: &str| Error::invariant(format!("{key} not found in secret {namespace}/{name}"));

        Ok(Self {
            certificate: field(SSL_CERTIFICATE_KEY)?.ok_or_else(|| missing(SSL_CERTIFICATE_KEY))?,
            private_key: field(SSL_PRIVATE_KEY_KEY)?.ok_or_else(|| missing(SSL_PRIVATE_KEY_KEY))?,
            ca_certificate: field(SSL_CA_CERTIFICATE_KEY)?,
        })
    }

    /// Reject material the load balancer API would refuse.
    pub fn validate(&self) -> Result<()> {
        let (_, pem) = parse_x509_pem(self.certificate.as_bytes())
            .map_err(|e| Error::validation(format!("{SSL_CERTIFICATE_KEY} is not PEM: {e}")))?;
        if pem.label != "CERTIFICATE" {
            return Err(Error::validation(format!(
                "{SSL_CERTIFICATE_KEY} holds a {:?} block, expected CERTIFICATE",
                pem.label
            )));
        }
        let cert = pem.parse_x509().map_err(|e| {
            Error::validation(format!("{SSL_CERTIFICATE_KEY} is not an X.509 certificate: {e}"))
        })?;
        if !cert.validity().is_valid() {
            warn!(
                "Certificate for {} is outside its validity period (not after {})",
                cert.subject(),
                cert.validity().not_after
            );
        }
        if !self.private_key.contains("PRIVATE KEY-----") {
            return Err(Error::validation(format!(
                "{SSL_PRIVATE_KEY_KEY} is not a PEM private key"
            )));
        }
        debug!("Validated certificate for {}", cert.subject());
        Ok(())
    }
}

/// Source of TLS secrets.
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn read_tls_secret(&self, namespace: &str, name: &str) -> Result<TlsSecret>;
}

/// Reads secrets through the Kubernetes API.
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn read_tls_secret(&self, namespace: &str, name: &str) -> Result<TlsSecret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        let data: BTreeMap<String, Vec<u8>> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        TlsSecret::from_data(namespace, name, &data)
    }
}

/// In-memory secrets keyed by `namespace/name`.
#[derive(Default)]
pub struct StaticSecretReader {
    secrets: Mutex<BTreeMap<String, TlsSecret>>,
}

impl StaticSecretReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, name: &str, secret: TlsSecret) {
        let mut secrets = match self.secrets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        secrets.insert(format!("{namespace}/{name}"), secret);
    }
}

#[async_trait]
impl SecretReader for StaticSecretReader {
    async fn read_tls_secret(&self, namespace: &str, name: &str) -> Result<TlsSecret> {
        let secrets = match self.secrets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        secrets
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("secret {namespace}/{name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["lb.example.com".to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn test_from_data_requires_cert_and_key() {
        let mut data = BTreeMap::new();
        data.insert(SSL_CERTIFICATE_KEY.to_string(), b"cert".to_vec());
        let err = TlsSecret::from_data("default", "tls", &data).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(msg) if msg.contains("tls.key")));

        data.insert(SSL_PRIVATE_KEY_KEY.to_string(), b"key".to_vec());
        let secret = TlsSecret::from_data("default", "tls", &data).unwrap();
        assert_eq!(secret.certificate, "cert");
        assert!(secret.ca_certificate.is_none());
    }

    #[test]
    fn test_validate_accepts_generated_certificate() {
        let (cert, key) = self_signed();
        let secret = TlsSecret {
            certificate: cert,
            private_key: key,
            ca_certificate: None,
        };
        secret.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let (_, key) = self_signed();
        let secret = TlsSecret {
            certificate: "not a certificate".to_string(),
            private_key: key.clone(),
            ca_certificate: None,
        };
        assert!(matches!(secret.validate(), Err(Error::ValidationError(_))));

        let secret = TlsSecret {
            certificate: key.clone(),
            private_key: key,
            ca_certificate: None,
        };
        assert!(matches!(secret.validate(), Err(Error::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_static_reader() {
        let reader = StaticSecretReader::new();
        reader.insert(
            "kube-system",
            "tls",
            TlsSecret {
                certificate: "c".to_string(),
                private_key: "k".to_string(),
                ca_certificate: None,
            },
        );
        assert!(reader.read_tls_secret("kube-system", "tls").await.is_ok());
        assert!(reader
            .read_tls_secret("default", "tls")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
