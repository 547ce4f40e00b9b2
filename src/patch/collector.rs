//! Static proxy config for Jaeger and Datadog tracing.
//!
//! The proxy reads its tracing cluster from a file in a shared emptyDir
//! volume. A busybox init container writes the file before the proxy starts.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::{Collector, TracingBackend};

pub const CONFIG_VOLUME_NAME: &str = "config";
pub const CONFIG_MOUNT_PATH: &str = "/tmp/envoy";
pub const CONFIG_FILE: &str = "/tmp/envoy/envoyconf.yaml";
const CONFIG_WRITER_IMAGE: &str = "busybox";

/// Render the proxy config snippet pointing at a collector
pub fn render_collector_config(backend: &TracingBackend) -> Option<String> {
    match backend {
        TracingBackend::Jaeger(c) => Some(jaeger_config(c)),
        TracingBackend::Datadog(c) => Some(datadog_config(c)),
        TracingBackend::XRay => None,
    }
}

fn jaeger_config(c: &Collector) -> String {
    format!(
        r#"
tracing:
 http:
  name: envoy.zipkin
  typed_config:
   "@type": type.googleapis.com/envoy.config.trace.v2.ZipkinConfig
   collector_cluster: jaeger
   collector_endpoint: "/api/v1/spans"
   shared_span_context: false
static_resources:
  clusters:
  - name: jaeger
    connect_timeout: 1s
    type: strict_dns
    lb_policy: round_robin
    load_assignment:
      cluster_name: jaeger
      endpoints:
      - lb_endpoints:
        - endpoint:
           address:
            socket_address:
             address: {address}
             port_value: {port}
"#,
        address = c.address,
        port = c.port
    )
}

fn datadog_config(c: &Collector) -> String {
    format!(
        r#"
tracing:
  http:
    name: envoy.tracers.datadog
    config:
      collector_cluster: datadog_agent
      service_name: envoy
static_resources:
  clusters:
  - name: datadog_agent
    connect_timeout: 1s
    type: strict_dns
    lb_policy: round_robin
    load_assignment:
      cluster_name: datadog_agent
      endpoints:
      - lb_endpoints:
        - endpoint:
           address:
            socket_address:
             address: {address}
             port_value: {port}
"#,
        address = c.address,
        port = c.port
    )
}

/// Shared volume between the config writer and the proxy
pub(super) fn render_config_volume() -> Volume {
    Volume {
        name: CONFIG_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Init container that writes the collector config, `None` for X-Ray
pub(super) fn render_collector_init(backend: &TracingBackend) -> Option<Container> {
    let config = render_collector_config(backend)?;
    let script = format!("cat <<'EOF' >> {CONFIG_FILE}{config}EOF\n\ncat {CONFIG_FILE}\n");

    Some(Container {
        name: format!("inject-{}-config", backend.name()),
        image: Some(CONFIG_WRITER_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![VolumeMount {
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            name: CONFIG_VOLUME_NAME.to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("100m".to_string())),
                ("memory".to_string(), Quantity("64Mi".to_string())),
            ])),
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("10m".to_string())),
                ("memory".to_string(), Quantity("32Mi".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    })
}
