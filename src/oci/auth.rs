//! API-key request signing
//!
//! OCI authenticates every call with an HTTP signature (draft-cavage) over a
//! fixed header list. GET/DELETE sign `date (request-target) host`; calls
//! with a body additionally sign `content-length content-type x-content-sha256`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use sha2::{Digest, Sha256};

use crate::config::AuthConfig;
use crate::error::{Error, Result};

const GENERIC_HEADERS: &[&str] = &["date", "(request-target)", "host"];
const BODY_HEADERS: &[&str] = &["content-length", "content-type", "x-content-sha256"];

/// Format of the `date` header.
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Headers to add to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub headers: Vec<(&'static str, String)>,
}

impl SignedHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub struct RequestSigner {
    key_id: String,
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn from_config(auth: &AuthConfig) -> Result<Self> {
        if auth.use_instance_principals {
            return Err(Error::ConfigError(
                "instance principal authentication is not supported by this client".to_string(),
            ));
        }
        if !auth.passphrase.is_empty() || auth.private_key.contains("ENCRYPTED") {
            return Err(Error::ConfigError(
                "passphrase protected API keys are not supported".to_string(),
            ));
        }
        let key_id = format!("{}/{}/{}", auth.tenancy, auth.user, auth.fingerprint);
        Self::new(key_id, auth.private_key.as_bytes())
    }

    /// `key_id` is `{tenancy}/{user}/{fingerprint}`.
    pub fn new(key_id: String, pem: &[u8]) -> Result<Self> {
        let der = PrivateKeyDer::from_pem_slice(pem)
            .map_err(|e| Error::ConfigError(format!("failed to parse API key: {e}")))?;
        let key_pair = match &der {
            PrivateKeyDer::Pkcs1(k) => RsaKeyPair::from_der(k.secret_pkcs1_der()),
            PrivateKeyDer::Pkcs8(k) => RsaKeyPair::from_pkcs8(k.secret_pkcs8_der()),
            _ => {
                return Err(Error::ConfigError(
                    "API key must be an RSA private key".to_string(),
                ))
            }
        }
        .map_err(|e| Error::ConfigError(format!("invalid RSA API key: {e}")))?;

        Ok(Self {
            key_id,
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign a request and return every header that was covered plus `authorization`.
    ///
    /// `path_and_query` is the request target as sent, e.g.
    /// `/20170115/loadBalancers?compartmentId=...`.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        path_and_query: &str,
        body: Option<&[u8]>,
        date: &str,
    ) -> Result<SignedHeaders> {
        let mut headers: Vec<(&'static str, String)> = vec![
            ("date", date.to_string()),
            ("host", host.to_string()),
        ];
        let mut names: Vec<&str> = GENERIC_HEADERS.to_vec();

        if let Some(body) = body {
            let digest = Sha256::digest(body);
            headers.push(("content-length", body.len().to_string()));
            headers.push(("content-type", "application/json".to_string()));
            headers.push(("x-content-sha256", BASE64.encode(digest)));
            names.extend_from_slice(BODY_HEADERS);
        }

        let signing_string = names
            .iter()
            .map(|name| {
                if *name == "(request-target)" {
                    format!(
                        "(request-target): {} {}",
                        method.to_lowercase(),
                        path_and_query
                    )
                } else {
                    let value = headers
                        .iter()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.as_str())
                        .unwrap_or_default();
                    format!("{name}: {value}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &self.rng,
                signing_string.as_bytes(),
                &mut signature,
            )
            .map_err(|e| Error::SigningError(e.to_string()))?;

        headers.push((
            "authorization",
            format!(
                "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
                self.key_id,
                names.join(" "),
                BASE64.encode(signature)
            ),
        ));
        Ok(SignedHeaders { headers })
    }
}
