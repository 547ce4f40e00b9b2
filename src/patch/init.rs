//! Traffic redirection init container.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, ResourceRequirements, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::sidecar::PROXY_UID;

pub const INIT_CONTAINER_NAME: &str = "proxyinit";
/// Port the proxy accepts redirected inbound traffic on
const PROXY_INGRESS_PORT: i32 = 15000;
/// Port the proxy accepts redirected outbound traffic on
const PROXY_EGRESS_PORT: i32 = 15001;

/// Values for the init container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitMeta {
    pub container_image: String,
    /// Comma separated application ports redirected through the proxy
    pub ports: String,
    pub egress_ignored_ports: String,
    pub ignored_ips: String,
    pub cpu_requests: String,
    pub memory_requests: String,
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub(super) fn render_init(meta: &InitMeta) -> Container {
    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(meta.container_image.clone()),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        env: Some(vec![
            env("APPMESH_START_ENABLED", "1"),
            env("APPMESH_IGNORE_UID", PROXY_UID.to_string()),
            env("APPMESH_ENVOY_INGRESS_PORT", PROXY_INGRESS_PORT.to_string()),
            env("APPMESH_ENVOY_EGRESS_PORT", PROXY_EGRESS_PORT.to_string()),
            env("APPMESH_APP_PORTS", meta.ports.as_str()),
            env("APPMESH_EGRESS_IGNORED_IP", meta.ignored_ips.as_str()),
            env("APPMESH_EGRESS_IGNORED_PORTS", meta.egress_ignored_ports.as_str()),
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(meta.cpu_requests.clone())),
                ("memory".to_string(), Quantity(meta.memory_requests.clone())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}
