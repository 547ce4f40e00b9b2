//! Test fixtures: pod builder, admission review wrapper and a static
//! ReplicaSet lookup.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, LocalObjectReference, Pod, PodSecurityContext, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::{Value, json};

use appmesh_inject::webhooks::ReplicaSetLookup;
use appmesh_inject::{Error, Result, ServerConfig};

/// Server config used across scenarios
pub fn config() -> ServerConfig {
    ServerConfig {
        mesh_name: "global".to_string(),
        region: "us-west-2".to_string(),
        log_level: "debug".to_string(),
        ..Default::default()
    }
}

/// Builder for pods as they arrive in an admission request.
///
/// # Example
/// ```
/// let pod = PodBuilder::new("podinfo-")
///     .annotation("appmesh.k8s.aws/ports", "9898")
///     .container("podinfo", &[9898])
///     .build();
/// ```
#[derive(Clone, Debug, Default)]
pub struct PodBuilder {
    generate_name: String,
    namespace: Option<String>,
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    containers: Vec<Container>,
    init_containers: Vec<Container>,
    image_pull_secrets: Vec<LocalObjectReference>,
    owner: Option<OwnerReference>,
    fs_group: Option<i64>,
}

impl PodBuilder {
    pub fn new(generate_name: impl Into<String>) -> Self {
        Self {
            generate_name: generate_name.into(),
            ..Default::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an application container declaring the given ports
    pub fn container(mut self, name: &str, ports: &[i32]) -> Self {
        let ports = (!ports.is_empty()).then(|| {
            ports
                .iter()
                .map(|p| ContainerPort {
                    container_port: *p,
                    ..Default::default()
                })
                .collect()
        });
        self.containers.push(Container {
            name: name.to_string(),
            image: Some(format!("example/{name}")),
            ports,
            ..Default::default()
        });
        self
    }

    pub fn init_container(mut self, name: &str) -> Self {
        self.init_containers.push(Container {
            name: name.to_string(),
            image: Some("busybox".to_string()),
            ..Default::default()
        });
        self
    }

    pub fn image_pull_secret(mut self, name: &str) -> Self {
        self.image_pull_secrets.push(LocalObjectReference {
            name: name.to_string(),
        });
        self
    }

    /// Set the managing controller
    pub fn owned_by(mut self, kind: &str, name: &str, uid: &str) -> Self {
        self.owner = Some(controller_ref(kind, name, uid));
        self
    }

    pub fn fs_group(mut self, fs_group: i64) -> Self {
        self.fs_group = Some(fs_group);
        self
    }

    pub fn build(self) -> Pod {
        let non_empty = |m: BTreeMap<String, String>| (!m.is_empty()).then_some(m);
        Pod {
            metadata: ObjectMeta {
                generate_name: Some(self.generate_name),
                namespace: self.namespace,
                annotations: non_empty(self.annotations),
                labels: non_empty(self.labels),
                owner_references: self.owner.map(|o| vec![o]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: self.containers,
                init_containers: (!self.init_containers.is_empty()).then_some(self.init_containers),
                image_pull_secrets: (!self.image_pull_secrets.is_empty())
                    .then_some(self.image_pull_secrets),
                security_context: self.fs_group.map(|g| PodSecurityContext {
                    fs_group: Some(g),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub fn controller_ref(kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        ..Default::default()
    }
}

/// Wrap a pod in a CREATE AdmissionReview
pub fn admission_review(uid: &str, namespace: &str, pod: &Pod) -> Value {
    let mut object = serde_json::to_value(pod).unwrap_or_default();
    object["apiVersion"] = json!("v1");
    object["kind"] = json!("Pod");
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": uid,
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "",
            "namespace": namespace,
            "operation": "CREATE",
            "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
            "object": object
        }
    })
}

/// ReplicaSets held in memory, keyed by namespace and name
#[derive(Default)]
pub struct StaticReplicaSets {
    sets: BTreeMap<(String, String), ReplicaSet>,
}

impl StaticReplicaSets {
    /// Add a ReplicaSet, optionally owned by a Deployment
    pub fn with(mut self, namespace: &str, name: &str, uid: &str, deployment: Option<&str>) -> Self {
        let rs = ReplicaSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                owner_references: deployment
                    .map(|d| vec![controller_ref("Deployment", d, &format!("{d}-uid"))]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.sets.insert((namespace.to_string(), name.to_string()), rs);
        self
    }
}

#[async_trait]
impl ReplicaSetLookup for StaticReplicaSets {
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        self.sets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("replicasets.apps \"{name}\" not found"),
                    reason: "NotFound".to_string(),
                    code: 404,
                }))
            })
    }
}
