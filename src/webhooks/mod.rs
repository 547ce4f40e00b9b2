//! Mutating admission webhook for proxy injection.
//!
//! The handler resolves per-pod values from annotations and the owning
//! controller, then answers with a JSON Patch built by [`crate::patch`].

pub mod annotations;
pub mod owner;
mod server;

pub use annotations::{injection_enabled, resolve};
pub use owner::{KubeReplicaSets, ReplicaSetLookup, controller_name};
pub use server::{WRONG_CONTENT_TYPE_BODY, WebhookState, create_webhook_router, run_webhook_server};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
