//! Controller-specific error types.
//!
//! Errors returned from a reconciliation attempt. Everything except
//! `InvalidConfig` is retried through the per-object backoff; a
//! configuration error waits for the object to change.

use kube::Error as KubeError;
use scvmm_client::ScvmmError;
use thiserror::Error;

/// Errors that can occur in the ScvmmMachine controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Remote session or decode failure
    #[error("SCVMM error: {0}")]
    Scvmm(#[from] ScvmmError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Referenced ScvmmProvider does not exist
    #[error("ScvmmProvider not found: {0}")]
    ProviderNotFound(String),

    /// Referenced secret does not exist
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Bootstrap data could not be read
    #[error("Bootstrap data unavailable: {0}")]
    Bootstrap(String),

    /// Payload encoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether the attempt should be retried without a change to the object
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ControllerError::InvalidConfig(_))
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        ControllerError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(err: serde_yaml::Error) -> Self {
        ControllerError::Serialization(err.to_string())
    }
}

impl From<crds::QuantityError> for ControllerError {
    fn from(err: crds::QuantityError) -> Self {
        ControllerError::InvalidConfig(err.to_string())
    }
}
