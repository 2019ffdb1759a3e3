//! Error types for the OCI cloud controller
//!
//! A single error enum is shared by the cloud facade, the reconcilers and the
//! controllers. The predicates on [`Error`] decide control flow: `NotFound`
//! becomes create-on-absent or success-on-delete, everything else aborts the
//! current reconciliation and is retried by the platform.

use thiserror::Error;

/// Main error type for cloud-controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    KubeError(#[source] kube::Error),

    /// Provider configuration is missing or invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Service or claim asks for a feature this provider does not support
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Malformed annotation, parameter or field value
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A required annotation or field for a configured feature is absent
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Resource lookup found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-success response from the OCI REST API
    #[error("OCI API error (status {status}, code {code}): {message}")]
    CloudApi {
        status: u16,
        code: String,
        message: String,
    },

    /// Transport error talking to the OCI REST API
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// A work request reached the FAILED state
    #[error("WorkRequest {id:?} failed: {message}")]
    WorkRequestFailed { id: String, message: String },

    /// A polled resource did not reach the expected state in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Request signing failed
    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error raised by the kube-rs finalizer helper
    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(err)
            | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// True if the error means the remote resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::CloudApi { status, .. } => *status == 404,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True for optimistic-concurrency failures (stale ETag).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::CloudApi { status, .. } if *status == 409 || *status == 412)
    }

    /// Throttling, server-side or transport failures worth retrying in place.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::HttpError(_) => true,
            Error::CloudApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the controller should retry on the short interval.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::HttpError(_)
            | Error::WorkRequestFailed { .. }
            | Error::Timeout(_) => true,
            Error::CloudApi { .. } => self.is_transient() || self.is_conflict(),
            _ => false,
        }
    }

    /// Short label used for error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::Unsupported(_) => "unsupported",
            Error::ValidationError(_) => "validation",
            Error::InvariantViolation(_) => "invariant",
            Error::NotFound(_) => "not_found",
            Error::CloudApi { .. } | Error::HttpError(_) => "cloud",
            Error::WorkRequestFailed { .. } => "work_request",
            Error::Timeout(_) => "timeout",
            _ => "unknown",
        }
    }
}

/// Result type alias for cloud-controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
