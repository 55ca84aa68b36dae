//! Error types for the quorum operator.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// The stored object changed since it was read.
    #[error("Conflict updating {kind}/{name} in namespace {namespace}: resource version changed")]
    Conflict {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Platform failure that is not a Kubernetes client error (network, 5xx).
    #[error("Platform error: {0}")]
    Platform(String),

    /// The assembly spec cannot be rendered into resources.
    #[error("Invalid assembly spec: {0}")]
    InvalidSpec(String),

    /// Invalid operator configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A REST call answered with a status code outside the accepted set.
    #[error("Got unexpected {method} status code {status} for {path}: {message}")]
    UnexpectedStatus {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// Status code returned.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// A replacement pod did not become ready in time.
    #[error("Pod {namespace}/{pod} did not become ready within {timeout:?}")]
    ReadinessTimeout {
        /// Pod namespace.
        namespace: String,
        /// Pod name.
        pod: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// A StatefulSet pod template carries no generation annotation.
    #[error("StatefulSet {namespace}/{name} has no generation annotation on its pod template")]
    MissingGeneration {
        /// StatefulSet namespace.
        namespace: String,
        /// StatefulSet name.
        name: String,
    },

    /// Managed resources still exist after deletion was requested.
    #[error("Deletion of assembly {namespace}/{name} pending: {remaining} resources remain")]
    DeletionPending {
        /// Assembly namespace.
        namespace: String,
        /// Assembly name.
        name: String,
        /// Number of resources still present.
        remaining: usize,
    },

    /// Certificate generation error.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    HttpError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    /// Whether retrying the same reconciliation later may succeed without user action.
    pub fn is_transient(&self) -> bool {
        match self {
            OperatorError::KubeError(kube::Error::Api(err)) => err.code >= 500 || err.code == 409,
            OperatorError::KubeError(_) => true,
            OperatorError::Conflict { .. }
            | OperatorError::Platform(_)
            | OperatorError::ReadinessTimeout { .. }
            | OperatorError::DeletionPending { .. }
            | OperatorError::HttpError(_) => true,
            OperatorError::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Short CamelCase reason used in status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::KubeError(_) | OperatorError::Platform(_) => "PlatformError",
            OperatorError::NotFound { .. } => "NotFound",
            OperatorError::Conflict { .. } => "Conflict",
            OperatorError::InvalidSpec(_) => "InvalidSpec",
            OperatorError::InvalidConfig(_) => "InvalidConfig",
            OperatorError::UnexpectedStatus { .. } => "UnexpectedStatus",
            OperatorError::ReadinessTimeout { .. } => "ReadinessTimeout",
            OperatorError::MissingGeneration { .. } => "MissingGeneration",
            OperatorError::DeletionPending { .. } => "DeletionPending",
            OperatorError::Certificate(_) => "CertificateError",
            OperatorError::SerializationError(_) => "SerializationError",
            OperatorError::HttpError(_) => "HttpError",
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<rcgen::RcgenError> for OperatorError {
    fn from(err: rcgen::RcgenError) -> Self {
        OperatorError::Certificate(err.to_string())
    }
}
