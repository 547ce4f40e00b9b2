//! Error types for the injector.
//!
//! Errors are classified so the admission handler can tell a real failure
//! (reported back in the AdmissionResponse) from a pod that simply has
//! nothing to inject.

use kube::core::admission::SerializePatchError;
use thiserror::Error;

/// Error type for webhook operations
#[derive(Error, Debug)]
pub enum Error {
    /// Request body is not a valid AdmissionReview
    #[error("Failed to decode AdmissionReview: {0}")]
    Decode(#[source] serde_json::Error),

    /// AdmissionReview carried no request
    #[error("No Object passed to mutate")]
    NoObject,

    /// AdmissionRequest carried an empty UID
    #[error("No UID from request")]
    NoUid,

    /// Request object could not be read as a Pod
    #[error("Failed to decode Pod: {0}")]
    PodDecode(String),

    /// Neither the ports annotation nor any container port is present
    #[error("No ports specified for injection, doing nothing")]
    NoPorts,

    /// Neither the virtual node annotation nor a controller owner is present
    #[error("No VirtualNode name specified for injection, doing nothing")]
    NoName,

    /// A patch fragment could not be rendered
    #[error("Failed to render patch: {0}")]
    Render(#[source] serde_json::Error),

    /// The assembled patch could not be attached to the response
    #[error("Failed to serialize patch: {0}")]
    SerializePatch(#[from] SerializePatchError),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid startup configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// HTTP server error
    #[error("Webhook server error: {0}")]
    Server(String),
}

impl Error {
    /// Check if this error means "leave the pod alone" rather than a failure.
    ///
    /// Skip conditions produce an allowed response without a patch.
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::NoPorts | Error::NoName)
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}

/// Result type alias for webhook operations
pub type Result<T> = std::result::Result<T, Error>;
