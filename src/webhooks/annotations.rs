//! Per-pod overrides read from annotations.
//!
//! Every value follows the same precedence: pod annotation, then server
//! config, then a computed fallback. Missing ports or virtual node name are
//! reported as skip errors so the handler admits the pod untouched.

use tracing::{debug, warn};

use crate::config::{Collector, ServerConfig, TracingBackend};
use crate::error::{Error, Result};
use crate::patch::{
    ECR_SECRET_NAME, EGRESS_IGNORED_PORTS_ANNOTATION, InitMeta, MESH_ANNOTATION, PORTS_ANNOTATION,
    PatchMeta, SidecarMeta,
};
use crate::pod::PodDescriptor;
use crate::webhooks::owner::{ReplicaSetLookup, controller_name};

pub const SIDECAR_INJECT_ANNOTATION: &str = "appmesh.k8s.aws/sidecarInjectorWebhook";
pub const VIRTUAL_NODE_ANNOTATION: &str = "appmesh.k8s.aws/virtualNode";
/// Older spelling of the egress ignored ports annotation
pub const LEGACY_EGRESS_IGNORED_PORTS_ANNOTATION: &str = "appmesh.k8s.aws/egress_ignored_ports";
pub const CPU_REQUEST_ANNOTATION: &str = "appmesh.k8s.aws/cpuRequest";
pub const MEMORY_REQUEST_ANNOTATION: &str = "appmesh.k8s.aws/memoryRequest";
pub const PREVIEW_ANNOTATION: &str = "appmesh.k8s.aws/preview";
pub const CNI_ANNOTATION: &str = "appmesh.k8s.aws/appmeshCNI";
pub const TRACING_ANNOTATION: &str = "appmesh.k8s.aws/tracing";
pub const TRACING_ADDRESS_ANNOTATION: &str = "appmesh.k8s.aws/tracingAddress";
pub const TRACING_PORT_ANNOTATION: &str = "appmesh.k8s.aws/tracingPort";
/// Present on pods scheduled onto Fargate, where the CNI plugin redirects traffic
pub const FARGATE_PROFILE_LABEL: &str = "eks.amazonaws.com/fargate-profile";

pub const DEFAULT_EGRESS_IGNORED_PORTS: &str = "22";

/// Check whether the pod wants the proxy.
///
/// An explicit `enabled`/`disabled` wins. Anything else falls back to the
/// server default.
pub fn injection_enabled(pod: &PodDescriptor, default: bool) -> bool {
    let Some(value) = pod.annotation(SIDECAR_INJECT_ANNOTATION) else {
        return default;
    };
    if value.eq_ignore_ascii_case("enabled") {
        true
    } else if value.eq_ignore_ascii_case("disabled") {
        false
    } else {
        warn!(
            pod = %pod.name,
            namespace = %pod.namespace,
            value = %value,
            default,
            "Invalid sidecarInjectorWebhook annotation, using default"
        );
        default
    }
}

/// Application ports to redirect: the annotation verbatim, or every declared
/// container port joined with commas
pub fn resolve_ports(pod: &PodDescriptor) -> Result<String> {
    if let Some(ports) = pod.annotation(PORTS_ANNOTATION) {
        return Ok(ports.to_string());
    }
    if pod.container_ports.is_empty() {
        return Err(Error::NoPorts);
    }
    Ok(pod
        .container_ports
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

pub fn resolve_egress_ignored_ports(pod: &PodDescriptor) -> String {
    pod.annotation(EGRESS_IGNORED_PORTS_ANNOTATION)
        .or_else(|| pod.annotation(LEGACY_EGRESS_IGNORED_PORTS_ANNOTATION))
        .unwrap_or(DEFAULT_EGRESS_IGNORED_PORTS)
        .to_string()
}

/// Virtual node name: the annotation, or `<controller>-<namespace>`.
///
/// The cluster is only consulted when the annotation is missing.
pub async fn resolve_virtual_node(
    pod: &PodDescriptor,
    lookup: &dyn ReplicaSetLookup,
) -> Result<String> {
    if let Some(name) = pod.annotation(VIRTUAL_NODE_ANNOTATION) {
        return Ok(name.to_string());
    }
    let owner = controller_name(lookup, pod).await.ok_or(Error::NoName)?;
    Ok(format!("{}-{}", owner, pod.namespace))
}

fn resolve_preview(pod: &PodDescriptor, default: bool) -> bool {
    let Some(value) = pod.annotation(PREVIEW_ANNOTATION) else {
        return default;
    };
    match value.to_ascii_lowercase().as_str() {
        "enabled" | "true" | "1" => true,
        "disabled" | "false" | "0" => false,
        _ => {
            warn!(pod = %pod.name, value = %value, "Invalid preview annotation, using default");
            default
        }
    }
}

fn cni_mode(pod: &PodDescriptor) -> bool {
    pod.annotation(CNI_ANNOTATION)
        .is_some_and(|v| v.eq_ignore_ascii_case("enabled"))
        || pod.labels.contains_key(FARGATE_PROFILE_LABEL)
}

/// Collector host override. Ends up inside a shell heredoc, so whitespace
/// and quoting characters are refused.
fn collector_address(pod: &PodDescriptor) -> Option<&str> {
    let value = pod.annotation(TRACING_ADDRESS_ANNOTATION)?;
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'));
    if !valid {
        warn!(pod = %pod.name, value = %value, "Invalid tracingAddress annotation, using default");
        return None;
    }
    Some(value)
}

fn collector_port(pod: &PodDescriptor) -> Option<&str> {
    let value = pod.annotation(TRACING_PORT_ANNOTATION)?;
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Some(value),
        _ => {
            warn!(pod = %pod.name, value = %value, "Invalid tracingPort annotation, using default");
            None
        }
    }
}

/// Tracing backend for this pod, with collector address overrides applied
fn resolve_tracing(config: &ServerConfig, pod: &PodDescriptor) -> Option<TracingBackend> {
    let requested = pod.annotation(TRACING_ANNOTATION).map(str::to_ascii_lowercase);
    let backend = match requested.as_deref() {
        None => config.tracing_backend(),
        Some("jaeger") => Some(TracingBackend::Jaeger(config.jaeger_collector())),
        Some("datadog") => Some(TracingBackend::Datadog(config.datadog_collector())),
        Some("xray") => Some(TracingBackend::XRay),
        Some("none") => None,
        Some(other) => {
            warn!(pod = %pod.name, value = %other, "Unknown tracing annotation, using default");
            config.tracing_backend()
        }
    };

    let with_overrides = |c: Collector| Collector {
        address: collector_address(pod).map_or(c.address, str::to_string),
        port: collector_port(pod).map_or(c.port, str::to_string),
    };

    backend.map(|b| match b {
        TracingBackend::Jaeger(c) => TracingBackend::Jaeger(with_overrides(c)),
        TracingBackend::Datadog(c) => TracingBackend::Datadog(with_overrides(c)),
        TracingBackend::XRay => TracingBackend::XRay,
    })
}

/// Resolve everything the patch needs for one pod.
///
/// Fails with [`Error::NoPorts`] or [`Error::NoName`] when there is nothing
/// to inject.
pub async fn resolve(
    config: &ServerConfig,
    pod: &PodDescriptor,
    lookup: &dyn ReplicaSetLookup,
) -> Result<PatchMeta> {
    let ports = resolve_ports(pod)?;
    let virtual_node_name = resolve_virtual_node(pod, lookup).await?;

    let mesh_name = pod
        .annotation(MESH_ANNOTATION)
        .unwrap_or(config.mesh_name.as_str())
        .to_string();
    let cpu_requests = pod
        .annotation(CPU_REQUEST_ANNOTATION)
        .unwrap_or(config.sidecar_cpu_requests.as_str())
        .to_string();
    let memory_requests = pod
        .annotation(MEMORY_REQUEST_ANNOTATION)
        .unwrap_or(config.sidecar_memory_requests.as_str())
        .to_string();

    let meta = PatchMeta {
        existing: pod.existing,
        cni_mode: cni_mode(pod),
        image_pull_secret: config.ecr_secret.then(|| ECR_SECRET_NAME.to_string()),
        inject_fs_group: config.enable_iam_for_service_accounts,
        init: InitMeta {
            container_image: config.init_image.clone(),
            ports,
            egress_ignored_ports: resolve_egress_ignored_ports(pod),
            ignored_ips: config.ignored_ips.clone(),
            cpu_requests: cpu_requests.clone(),
            memory_requests: memory_requests.clone(),
        },
        sidecar: SidecarMeta {
            container_image: config.sidecar_image.clone(),
            mesh_name,
            virtual_node_name,
            preview: resolve_preview(pod, config.preview),
            log_level: config.log_level.clone(),
            region: config.region.clone(),
            cpu_requests,
            memory_requests,
            tracing: resolve_tracing(config, pod),
            enable_stats_tags: config.enable_stats_tags,
            enable_statsd: config.enable_statsd,
            inject_statsd_exporter: config.inject_statsd_exporter_sidecar,
        },
    };

    debug!(
        pod = %pod.name,
        namespace = %pod.namespace,
        ports = %meta.init.ports,
        virtual_node = %meta.sidecar.virtual_node_name,
        mesh = %meta.sidecar.mesh_name,
        cni_mode = meta.cni_mode,
        "Resolved injection values"
    );
    Ok(meta)
}
