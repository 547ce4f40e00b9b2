//! Proxy sidecar and its optional companion containers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ResourceRequirements, SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::collector::{CONFIG_FILE, CONFIG_MOUNT_PATH, CONFIG_VOLUME_NAME};
use crate::config::TracingBackend;

pub const PROXY_CONTAINER_NAME: &str = "envoy";
/// UID the proxy runs as; the init container excludes it from redirection
pub const PROXY_UID: i64 = 1337;
const PROXY_ADMIN_PORT: i32 = 9901;

pub const XRAY_DAEMON_IMAGE: &str = "amazon/aws-xray-daemon";
const XRAY_DAEMON_PORT: i32 = 2000;

pub const STATSD_EXPORTER_IMAGE: &str = "maddox/statsd-exporter";
const STATSD_EXPORTER_METRICS_PORT: i32 = 9102;
const STATSD_PORT: i32 = 8125;

/// Values for the sidecar containers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SidecarMeta {
    pub container_image: String,
    pub mesh_name: String,
    pub virtual_node_name: String,
    pub preview: bool,
    pub log_level: String,
    pub region: String,
    pub cpu_requests: String,
    pub memory_requests: String,
    pub tracing: Option<TracingBackend>,
    pub enable_stats_tags: bool,
    pub enable_statsd: bool,
    pub inject_statsd_exporter: bool,
}

impl SidecarMeta {
    /// Whether the proxy loads a static config file written by an init container
    pub fn static_config(&self) -> bool {
        self.tracing
            .as_ref()
            .is_some_and(|t| t.collector().is_some())
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn port(container_port: i32, name: &str, protocol: &str) -> ContainerPort {
    ContainerPort {
        container_port,
        name: Some(name.to_string()),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}

fn requests(meta: &SidecarMeta) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(meta.cpu_requests.clone())),
            ("memory".to_string(), Quantity(meta.memory_requests.clone())),
        ])),
        ..Default::default()
    }
}

fn proxy_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(PROXY_UID),
        ..Default::default()
    }
}

/// Render the sidecar list: the proxy first, then any companions
pub(super) fn render_sidecars(meta: &SidecarMeta) -> Vec<Container> {
    let mut sidecars = vec![render_proxy(meta)];

    if meta.tracing == Some(TracingBackend::XRay) {
        sidecars.push(render_xray_daemon(meta));
    }

    if meta.inject_statsd_exporter {
        sidecars.push(render_statsd_exporter(meta));
    }

    sidecars
}

fn render_proxy(meta: &SidecarMeta) -> Container {
    let mut env_vars = vec![
        env(
            "APPMESH_VIRTUAL_NODE_NAME",
            format!("mesh/{}/virtualNode/{}", meta.mesh_name, meta.virtual_node_name),
        ),
        env("APPMESH_PREVIEW", if meta.preview { "1" } else { "0" }),
        env("ENVOY_LOG_LEVEL", meta.log_level.as_str()),
    ];
    if meta.static_config() {
        env_vars.push(env("ENVOY_STATS_CONFIG_FILE", CONFIG_FILE));
    }
    env_vars.push(env("AWS_REGION", meta.region.as_str()));
    if meta.tracing == Some(TracingBackend::XRay) {
        env_vars.push(env("ENABLE_ENVOY_XRAY_TRACING", "1"));
    }
    if meta.enable_stats_tags {
        env_vars.push(env("ENABLE_ENVOY_STATS_TAGS", "1"));
    }
    if meta.enable_statsd {
        env_vars.push(env("ENABLE_ENVOY_DOG_STATSD", "1"));
    }

    let volume_mounts = meta.static_config().then(|| {
        vec![VolumeMount {
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            name: CONFIG_VOLUME_NAME.to_string(),
            ..Default::default()
        }]
    });

    Container {
        name: PROXY_CONTAINER_NAME.to_string(),
        image: Some(meta.container_image.clone()),
        security_context: Some(proxy_security_context()),
        ports: Some(vec![port(PROXY_ADMIN_PORT, "stats", "TCP")]),
        env: Some(env_vars),
        volume_mounts,
        resources: Some(requests(meta)),
        ..Default::default()
    }
}

fn render_xray_daemon(meta: &SidecarMeta) -> Container {
    Container {
        name: "xray-daemon".to_string(),
        image: Some(XRAY_DAEMON_IMAGE.to_string()),
        security_context: Some(proxy_security_context()),
        ports: Some(vec![port(XRAY_DAEMON_PORT, "xray", "UDP")]),
        resources: Some(requests(meta)),
        ..Default::default()
    }
}

fn render_statsd_exporter(meta: &SidecarMeta) -> Container {
    Container {
        name: "statsd-exporter".to_string(),
        image: Some(STATSD_EXPORTER_IMAGE.to_string()),
        security_context: Some(proxy_security_context()),
        args: Some(vec![
            format!("--web.listen-address=0.0.0.0:{STATSD_EXPORTER_METRICS_PORT}"),
            format!("--statsd.listen-tcp=0.0.0.0:{STATSD_PORT}"),
            format!("--statsd.listen-udp=0.0.0.0:{STATSD_PORT}"),
        ]),
        ports: Some(vec![
            port(STATSD_EXPORTER_METRICS_PORT, "metrics", "TCP"),
            port(STATSD_PORT, "tcpin", "TCP"),
            port(STATSD_PORT, "udpin", "UDP"),
        ]),
        resources: Some(requests(meta)),
        ..Default::default()
    }
}
