//! JSON Patch assembly for proxy injection.
//!
//! Every fragment is rendered from k8s-openapi types and added to the pod
//! through a [`PatchBuilder`], which picks between creating a target array
//! (`/spec/<field>` with an array value) and appending to it
//! (`/spec/<field>/-`). The builder remembers which targets exist, so once a
//! fragment has created an array every later fragment for the same field
//! appends to it.

mod collector;
mod init;
mod sidecar;

use std::collections::BTreeSet;

use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::LocalObjectReference;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::TracingBackend;
use crate::error::{Error, Result};
use crate::pod::ExistingFields;

pub use collector::{CONFIG_FILE, CONFIG_MOUNT_PATH, CONFIG_VOLUME_NAME, render_collector_config};
pub use init::{INIT_CONTAINER_NAME, InitMeta};
pub use sidecar::{
    PROXY_CONTAINER_NAME, PROXY_UID, STATSD_EXPORTER_IMAGE, SidecarMeta, XRAY_DAEMON_IMAGE,
};

/// Image pull secret injected when the ECR secret is enabled
pub const ECR_SECRET_NAME: &str = "appmesh-ecr-secret";

pub const MESH_ANNOTATION: &str = "appmesh.k8s.aws/mesh";
pub const PORTS_ANNOTATION: &str = "appmesh.k8s.aws/ports";
pub const EGRESS_IGNORED_PORTS_ANNOTATION: &str = "appmesh.k8s.aws/egressIgnoredPorts";
pub const EGRESS_IGNORED_IPS_ANNOTATION: &str = "appmesh.k8s.aws/egressIgnoredIPs";

/// Everything the assembler needs, resolved once per request
#[derive(Clone, Debug, PartialEq)]
pub struct PatchMeta {
    /// Fields the pod already has
    pub existing: ExistingFields,
    /// Traffic redirection is handled by the App Mesh CNI plugin
    pub cni_mode: bool,
    /// Image pull secret to add, if any
    pub image_pull_secret: Option<String>,
    /// Set `fsGroup` so the proxy can read projected service account tokens
    pub inject_fs_group: bool,
    pub init: InitMeta,
    pub sidecar: SidecarMeta,
}

/// Ordered JSON Patch under construction
pub struct PatchBuilder {
    operations: Vec<PatchOperation>,
    arrays: BTreeSet<&'static str>,
    annotations: bool,
}

impl PatchBuilder {
    /// Start a patch for a pod with the given existing fields
    pub fn new(existing: &ExistingFields) -> Self {
        let arrays = [
            ("initContainers", existing.init_containers),
            ("containers", existing.containers),
            ("imagePullSecrets", existing.image_pull_secrets),
            ("volumes", existing.volumes),
        ]
        .into_iter()
        .filter(|(_, len)| *len > 0)
        .map(|(field, _)| field)
        .collect();

        Self {
            operations: Vec::new(),
            arrays,
            annotations: existing.annotations,
        }
    }

    /// Add values to `/spec/<field>`.
    ///
    /// Creates the array with all values when the field is absent or empty,
    /// otherwise appends one operation per value.
    pub fn extend<T: Serialize>(&mut self, field: &'static str, values: &[T]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let rendered = values
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<Value>, _>>()
            .map_err(Error::Render)?;

        if self.arrays.contains(field) {
            for value in rendered {
                self.add(PointerBuf::from_tokens(["spec", field, "-"]), value);
            }
        } else {
            self.add(PointerBuf::from_tokens(["spec", field]), Value::Array(rendered));
            self.arrays.insert(field);
        }
        Ok(())
    }

    /// Set a pod annotation, creating the annotation map first when absent
    pub fn annotate(&mut self, key: &str, value: &str) {
        if !self.annotations {
            self.add(PointerBuf::from_tokens(["metadata", "annotations"]), json!({}));
            self.annotations = true;
        }
        self.add(
            PointerBuf::from_tokens(["metadata", "annotations", key]),
            Value::String(value.to_string()),
        );
    }

    /// Set a field of the pod security context, creating the context when absent
    pub fn security_context(&mut self, exists: bool, field: &str, value: Value) {
        if exists {
            self.add(
                PointerBuf::from_tokens(["spec", "securityContext", field]),
                value,
            );
        } else {
            let mut context = serde_json::Map::new();
            context.insert(field.to_string(), value);
            self.add(
                PointerBuf::from_tokens(["spec", "securityContext"]),
                Value::Object(context),
            );
        }
    }

    fn add(&mut self, path: PointerBuf, value: Value) {
        self.operations
            .push(PatchOperation::Add(AddOperation { path, value }));
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn build(self) -> Patch {
        Patch(self.operations)
    }
}

/// Assemble the injection patch for a pod.
///
/// In CNI mode the traffic redirection settings travel as pod annotations
/// instead of an init container. Sidecars, the pull secret and the tracing
/// config follow in that order.
pub fn build_patch(meta: &PatchMeta) -> Result<Patch> {
    let mut builder = PatchBuilder::new(&meta.existing);

    if meta.cni_mode {
        builder.annotate(MESH_ANNOTATION, &meta.sidecar.mesh_name);
        builder.annotate(PORTS_ANNOTATION, &meta.init.ports);
        builder.annotate(
            EGRESS_IGNORED_PORTS_ANNOTATION,
            &meta.init.egress_ignored_ports,
        );
        builder.annotate(EGRESS_IGNORED_IPS_ANNOTATION, &meta.init.ignored_ips);
    } else {
        builder.extend("initContainers", &[init::render_init(&meta.init)])?;
    }

    builder.extend("containers", &sidecar::render_sidecars(&meta.sidecar))?;

    if let Some(secret) = &meta.image_pull_secret {
        builder.extend(
            "imagePullSecrets",
            &[LocalObjectReference {
                name: secret.clone(),
            }],
        )?;
    }

    if let Some(backend) = &meta.sidecar.tracing {
        if let Some(container) = collector::render_collector_init(backend) {
            builder.extend("volumes", &[collector::render_config_volume()])?;
            builder.extend("initContainers", &[container])?;
        }
    }

    if meta.inject_fs_group && !meta.existing.fs_group {
        builder.security_context(
            meta.existing.security_context,
            "fsGroup",
            json!(PROXY_UID),
        );
    }

    debug!(
        operations = builder.len(),
        tracing = ?meta.sidecar.tracing.as_ref().map(TracingBackend::name),
        cni_mode = meta.cni_mode,
        "Assembled injection patch"
    );
    Ok(builder.build())
}

/// Assemble the patch and serialize it as compact JSON
pub fn generate_patch(meta: &PatchMeta) -> Result<Vec<u8>> {
    let patch = build_patch(meta)?;
    serde_json::to_vec(&patch).map_err(Error::Render)
}
