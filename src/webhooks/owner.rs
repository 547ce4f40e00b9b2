//! Controller owner lookup for pods without a virtual node annotation.
//!
//! Pods created by a Deployment are owned by a ReplicaSet, so one lookup is
//! needed to reach the Deployment name. Any other controller kind is used
//! as-is.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::pod::{PodDescriptor, controller_of};

const REPLICA_SET_KIND: &str = "ReplicaSet";

/// Read-only access to ReplicaSets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplicaSetLookup: Send + Sync {
    /// Fetch a ReplicaSet by namespace and name
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet>;
}

/// [`ReplicaSetLookup`] backed by the cluster API
pub struct KubeReplicaSets {
    client: Client,
}

impl KubeReplicaSets {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReplicaSetLookup for KubeReplicaSets {
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }
}

/// Name of the top-level controller that created the pod.
///
/// Returns `None` for orphans and whenever the owning ReplicaSet cannot be
/// read or is not the object the pod references (deleted and recreated
/// under the same name). Lookup failures are logged, never returned.
pub async fn controller_name(lookup: &dyn ReplicaSetLookup, pod: &PodDescriptor) -> Option<String> {
    let owner = pod.controller()?;

    if owner.kind != REPLICA_SET_KIND {
        return Some(owner.name.clone());
    }

    let rs = match lookup.get_replica_set(&pod.namespace, &owner.name).await {
        Ok(rs) => rs,
        Err(e) if e.is_not_found() => {
            debug!(
                replica_set = %owner.name,
                pod = %pod.name,
                namespace = %pod.namespace,
                "Owning ReplicaSet no longer exists"
            );
            return None;
        }
        Err(e) => {
            warn!(
                replica_set = %owner.name,
                pod = %pod.name,
                namespace = %pod.namespace,
                error = %e,
                "Cannot get ReplicaSet for pod"
            );
            return None;
        }
    };

    if rs.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
        warn!(
            replica_set = %owner.name,
            pod = %pod.name,
            expected_uid = %owner.uid,
            actual_uid = ?rs.metadata.uid,
            "ReplicaSet UID does not match pod owner reference"
        );
        return None;
    }

    match rs
        .metadata
        .owner_references
        .as_deref()
        .and_then(controller_of)
    {
        Some(parent) => {
            debug!(replica_set = %owner.name, controller = %parent.name, "Resolved ReplicaSet controller");
            Some(parent.name.clone())
        }
        None => Some(owner.name.clone()),
    }
}
