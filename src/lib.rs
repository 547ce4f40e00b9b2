//! appmesh-inject library crate
//!
//! Mutating admission webhook that injects the App Mesh proxy sidecar and its
//! traffic redirection init container into pods.

pub mod config;
pub mod error;
pub mod health;
pub mod patch;
pub mod pod;
pub mod webhooks;

pub use config::{ServerConfig, TracingBackend};
pub use error::{Error, Result};
pub use health::HealthState;
pub use patch::{PatchMeta, build_patch, generate_patch};
pub use pod::PodDescriptor;
pub use webhooks::{ReplicaSetLookup, WebhookState, create_webhook_router, run_webhook_server};
