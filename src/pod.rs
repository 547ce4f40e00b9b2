//! The parts of an admitted pod the injector looks at.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

/// Namespace assumed when neither the request nor the pod names one
const DEFAULT_NAMESPACE: &str = "default";

/// Which target fields the pod already has.
///
/// Drives the create-vs-append choice for every JSON Patch operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExistingFields {
    pub init_containers: usize,
    pub containers: usize,
    pub image_pull_secrets: usize,
    pub volumes: usize,
    pub annotations: bool,
    pub security_context: bool,
    pub fs_group: bool,
}

/// Snapshot of an admitted pod, taken once per request
#[derive(Clone, Debug, Default)]
pub struct PodDescriptor {
    /// Pod name, or its generateName prefix before the API server assigns one
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    /// Declared container ports in container order, duplicates kept
    pub container_ports: Vec<i32>,
    pub existing: ExistingFields,
}

impl PodDescriptor {
    /// Build a descriptor from a pod and the namespace of its admission request
    pub fn from_pod(pod: &Pod, request_namespace: Option<&str>) -> Self {
        let meta = &pod.metadata;
        let spec = pod.spec.as_ref();

        let namespace = request_namespace
            .filter(|ns| !ns.is_empty())
            .or(meta.namespace.as_deref())
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string();

        let name = meta
            .name
            .clone()
            .or_else(|| meta.generate_name.clone())
            .unwrap_or_default();

        let container_ports = spec
            .map(|s| {
                s.containers
                    .iter()
                    .flat_map(|c| c.ports.iter().flatten())
                    .map(|p| p.container_port)
                    .collect()
            })
            .unwrap_or_default();

        let security_context = spec.and_then(|s| s.security_context.as_ref());

        let existing = ExistingFields {
            init_containers: spec
                .and_then(|s| s.init_containers.as_ref())
                .map_or(0, Vec::len),
            containers: spec.map_or(0, |s| s.containers.len()),
            image_pull_secrets: spec
                .and_then(|s| s.image_pull_secrets.as_ref())
                .map_or(0, Vec::len),
            volumes: spec.and_then(|s| s.volumes.as_ref()).map_or(0, Vec::len),
            annotations: meta.annotations.is_some(),
            security_context: security_context.is_some(),
            fs_group: security_context.and_then(|sc| sc.fs_group).is_some(),
        };

        Self {
            name,
            namespace,
            annotations: meta.annotations.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            owner_references: meta.owner_references.clone().unwrap_or_default(),
            container_ports,
            existing,
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// The owner reference marked as the managing controller
    pub fn controller(&self) -> Option<&OwnerReference> {
        controller_of(&self.owner_references)
    }
}

/// Find the managing controller among owner references
pub fn controller_of(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter().find(|r| r.controller == Some(true))
}
